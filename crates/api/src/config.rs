//! Server configuration

use std::env;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}")]
    Invalid(&'static str),
}

/// Key used to verify Whop user tokens
#[derive(Debug, Clone)]
pub enum UserTokenKey {
    /// ES256 public key in PEM form, as issued by Whop
    Es256PublicKey(String),
    /// Shared HS256 secret for development and tests
    Hs256Secret(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub cron_secret: String,
    pub user_token_key: UserTokenKey,
    /// Expected `aud` claim on user tokens, when set
    pub app_id: Option<String>,
    pub allowed_origins: Vec<String>,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_token_key = match (
            optional("WHOP_USER_TOKEN_PUBLIC_KEY"),
            optional("WHOP_USER_TOKEN_SECRET"),
        ) {
            // PEM keys in env files usually carry escaped newlines
            (Some(pem), _) => UserTokenKey::Es256PublicKey(pem.replace("\\n", "\n")),
            (None, Some(secret)) => UserTokenKey::Hs256Secret(secret),
            (None, None) => return Err(ConfigError::Missing("WHOP_USER_TOKEN_PUBLIC_KEY")),
        };

        let bind_address =
            optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        if bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid("BIND_ADDRESS"));
        }

        Ok(Self {
            bind_address,
            database_url: required("DATABASE_URL")?,
            cron_secret: required("CRON_SECRET")?,
            user_token_key,
            app_id: optional("WHOP_APP_ID"),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
