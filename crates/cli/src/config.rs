use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use studyhall_api_client::ApiClient;

const DEFAULT_SERVER_URL: &str = "http://localhost:3000";
const CONFIG_FILE_NAME: &str = "studyhall.toml";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
}

/// Tokens from the last login, or a long-lived API key. Empty when logged out.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub nickname: String,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

impl AuthConfig {
    /// Session token first; the API key is the fallback.
    pub fn bearer(&self) -> Option<&str> {
        [self.access_token.trim(), self.api_key.trim()]
            .into_iter()
            .find(|t| !t.is_empty())
    }

    pub fn is_logged_in(&self) -> bool {
        self.bearer().is_some()
    }
}

/// `$STUDYHALL_CONFIG`, else the platform config dir (e.g. ~/.config/studyhall/studyhall.toml).
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("STUDYHALL_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let dirs = directories::ProjectDirs::from("", "", "studyhall")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
}

pub fn load_from(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
}

pub fn save_to(path: &Path, config: &CliConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn load_config() -> Result<CliConfig> {
    load_from(&config_path()?)
}

pub fn save_config(config: &CliConfig) -> Result<()> {
    save_to(&config_path()?, config)
}

/// Client for the configured server, authenticated when a token is stored.
pub fn client(config: &CliConfig) -> Result<ApiClient> {
    let mut client = ApiClient::new(&config.server.url, REQUEST_TIMEOUT)?;
    if let Some(token) = config.auth.bearer() {
        client.set_auth(token.to_string());
    }
    Ok(client)
}

pub fn run_config(server: Option<String>, api_key: Option<String>) -> Result<()> {
    if server.is_none() && api_key.is_none() {
        return show_config();
    }
    if let Some(url) = server {
        set_server(&url)?;
    }
    if let Some(key) = api_key {
        set_api_key(&key)?;
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let path = config_path()?;
    let config = load_from(&path)?;
    println!("config:  {}", path.display());
    println!("server:  {}", config.server.url);
    if !config.auth.access_token.is_empty() {
        println!("user:    {}", config.auth.nickname);
    } else if !config.auth.api_key.is_empty() {
        println!("user:    (api key)");
    } else {
        println!("user:    (not logged in)");
    }
    Ok(())
}

fn set_api_key(key: &str) -> Result<()> {
    let key = key.trim();
    if !key.starts_with("shk_") {
        anyhow::bail!("API keys start with `shk_`");
    }
    let mut config = load_config()?;
    config.auth.api_key = key.to_string();
    save_config(&config)?;
    println!("API key saved.");
    Ok(())
}

fn set_server(url: &str) -> Result<()> {
    let url = url.trim().trim_end_matches('/');
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("server URL must start with http:// or https://");
    }
    let mut config = load_config()?;
    if config.server.url != url {
        // Tokens belong to the old server.
        config.auth = AuthConfig::default();
    }
    config.server.url = url.to_string();
    save_config(&config)?;
    println!("server set to {url}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.url, DEFAULT_SERVER_URL);
        assert!(!config.auth.is_logged_in());
    }

    #[test]
    fn save_then_load_keeps_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = CliConfig::default();
        config.server.url = "https://study.example.com".into();
        config.auth.access_token = "tok".into();
        config.auth.nickname = "ada".into();
        save_to(&path, &config).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.server.url, "https://study.example.com");
        assert_eq!(loaded.auth.access_token, "tok");
        assert!(loaded.auth.refresh_token.is_empty());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[auth]\nnickname = \"ada\"\n").unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.server.url, DEFAULT_SERVER_URL);
        assert_eq!(loaded.auth.nickname, "ada");
    }

    #[test]
    fn bearer_prefers_session_token_over_api_key() {
        let mut auth = AuthConfig {
            api_key: "shk_abc".into(),
            ..Default::default()
        };
        assert_eq!(auth.bearer(), Some("shk_abc"));
        auth.access_token = "jwt".into();
        assert_eq!(auth.bearer(), Some("jwt"));
        assert!(AuthConfig::default().bearer().is_none());
    }
}
