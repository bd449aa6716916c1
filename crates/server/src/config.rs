use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use studyhall_tutor::gemini;

/// Server configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub port: u16,
    pub jwt_secret: String,
    /// HMAC key for signed file URLs.
    pub storage_secret: String,
    pub gemini_api_key: Option<String>,
    pub model: String,
    pub gemini_base_url: String,
    pub signed_url_ttl_secs: u64,
    pub max_upload_bytes: u64,
    pub chat_cache_capacity: usize,
    pub chat_cache_ttl: Duration,
    pub registration_open: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let jwt_secret = var("JWT_SECRET").unwrap_or_default();
        let storage_secret = var("STUDYHALL_STORAGE_SECRET")
            .or_else(|| (!jwt_secret.is_empty()).then(|| jwt_secret.clone()))
            .unwrap_or_else(|| {
                tracing::warn!(
                    "neither STUDYHALL_STORAGE_SECRET nor JWT_SECRET set; signed file URLs will not survive a restart"
                );
                random_secret()
            });

        let max_upload_mb: u64 = parse_or(&var, "STUDYHALL_MAX_UPLOAD_MB", 50);

        Self {
            data_dir: var("STUDYHALL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            base_url: var("BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".into())
                .trim_end_matches('/')
                .to_string(),
            port: parse_or(&var, "PORT", 3000),
            jwt_secret,
            storage_secret,
            gemini_api_key: var("GEMINI_API_KEY").or_else(|| var("GOOGLE_API_KEY")),
            model: var("STUDYHALL_MODEL").unwrap_or_else(|| gemini::DEFAULT_MODEL.into()),
            gemini_base_url: var("GEMINI_BASE_URL")
                .unwrap_or_else(|| gemini::DEFAULT_BASE_URL.into()),
            signed_url_ttl_secs: parse_or(&var, "STUDYHALL_SIGNED_URL_TTL_SECS", 3600),
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
            chat_cache_capacity: parse_or(&var, "STUDYHALL_CHAT_CACHE_CAPACITY", 100),
            chat_cache_ttl: Duration::from_secs(parse_or(
                &var,
                "STUDYHALL_CHAT_CACHE_TTL_SECS",
                1800,
            )),
            registration_open: var("STUDYHALL_REGISTRATION").as_deref() != Some("closed"),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        !self.jwt_secret.is_empty()
    }

    pub fn ai_enabled(&self) -> bool {
        self.gemini_api_key.is_some()
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    match var(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {name}={raw}");
            default
        }),
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
