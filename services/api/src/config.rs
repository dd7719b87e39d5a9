use avatar_realtime::AvatarConfig;
use avatar_realtime::config::DEFAULT_SERVICE_URL;
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// The avatar credentials are redacted from `Debug` output.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub avatar_url: String,
    pub avatar_app_id: String,
    pub avatar_api_key: SecretString,
    pub avatar_api_secret: SecretString,
    pub avatar_id: String,
    pub avatar_vcn: String,
    pub ready_timeout: Duration,
    pub cache_ttl: Duration,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn seconds(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(secs) => secs
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = required("DATABASE_URL")?;

        let avatar_url =
            std::env::var("AVATAR_URL").unwrap_or_else(|_| DEFAULT_SERVICE_URL.to_string());
        let avatar_app_id = required("AVATAR_APP_ID")?;
        let avatar_api_key = SecretString::from(required("AVATAR_API_KEY")?);
        let avatar_api_secret = SecretString::from(required("AVATAR_API_SECRET")?);
        let avatar_id = required("AVATAR_ID")?;
        let avatar_vcn = required("AVATAR_VCN")?;

        let ready_timeout = seconds("AVATAR_READY_TIMEOUT_SECS", 10)?;
        let cache_ttl = seconds("AVATAR_CACHE_TTL_SECS", 30 * 60)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            database_url,
            avatar_url,
            avatar_app_id,
            avatar_api_key,
            avatar_api_secret,
            avatar_id,
            avatar_vcn,
            ready_timeout,
            cache_ttl,
            log_level,
        })
    }

    /// Session settings for the avatar orchestrator.
    pub fn avatar_config(&self) -> AvatarConfig {
        AvatarConfig::new(
            self.avatar_url.clone(),
            self.avatar_app_id.clone(),
            self.avatar_api_key.expose_secret(),
            self.avatar_api_secret.expose_secret(),
            self.avatar_id.clone(),
            self.avatar_vcn.clone(),
        )
        .with_ready_timeout(self.ready_timeout)
        .with_cache_ttl(self.cache_ttl)
    }
}
