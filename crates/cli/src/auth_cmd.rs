use anyhow::{Context, Result};
use dialoguer::{Input, Password};

use studyhall_api::{AuthRegisterRequest, AuthTokenResponse, LoginRequest, RefreshRequest};

use crate::config::{AuthConfig, client, load_config, save_config};

fn prompt_email(email: Option<String>) -> Result<String> {
    match email {
        Some(e) => Ok(e),
        None => Ok(Input::<String>::new().with_prompt("Email").interact_text()?),
    }
}

fn store_tokens(tokens: AuthTokenResponse) -> Result<()> {
    let mut config = load_config()?;
    config.auth = AuthConfig {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        nickname: tokens.nickname,
        ..config.auth
    };
    save_config(&config)
}

pub async fn run_login(email: Option<String>) -> Result<()> {
    let email = prompt_email(email)?;
    let password = Password::new().with_prompt("Password").interact()?;
    let config = load_config()?;
    let tokens = client(&config)?
        .login(&LoginRequest { email, password })
        .await
        .context("login failed")?;
    println!("Logged in as {}", tokens.nickname);
    store_tokens(tokens)
}

pub async fn run_register(email: Option<String>, nickname: Option<String>) -> Result<()> {
    let email = prompt_email(email)?;
    let nickname = match nickname {
        Some(n) => n,
        None => Input::<String>::new().with_prompt("Nickname").interact_text()?,
    };
    let password = Password::new()
        .with_prompt("Password")
        .with_confirmation("Repeat password", "Passwords do not match")
        .interact()?;
    let config = load_config()?;
    let tokens = client(&config)?
        .register(&AuthRegisterRequest {
            email,
            password,
            nickname,
        })
        .await
        .context("registration failed")?;
    println!("Registered and logged in as {}", tokens.nickname);
    store_tokens(tokens)
}

/// Swap the stored refresh token for a new token pair.
pub async fn run_refresh() -> Result<()> {
    let config = load_config()?;
    if config.auth.refresh_token.is_empty() {
        anyhow::bail!("not logged in (run `studyhall login`)");
    }
    let tokens = client(&config)?
        .refresh(&RefreshRequest {
            refresh_token: config.auth.refresh_token.clone(),
        })
        .await
        .context("session expired, log in again")?;
    store_tokens(tokens)?;
    println!("Session refreshed.");
    Ok(())
}

pub async fn run_whoami() -> Result<()> {
    let config = load_config()?;
    let me = client(&config)?.me().await?;
    println!("{} <{}>", me.nickname, me.email);
    Ok(())
}

pub fn run_logout() -> Result<()> {
    let mut config = load_config()?;
    config.auth = AuthConfig::default();
    save_config(&config)?;
    println!("Logged out.");
    Ok(())
}
