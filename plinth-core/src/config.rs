//! Environment-based platform configuration.

use std::fmt;

/// Broker connection settings. The transport itself is an external
/// collaborator; the platform only validates and carries these.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Postgres connection string. Required.
    pub database_url: String,
    /// Public origin of the frontend.
    pub base_url: String,
    /// In-cluster origin of this backend, used by the inter-plugin fetch
    /// client.
    pub internal_url: String,
    /// Brand name; the initial admin is seeded as `admin@<brand>`.
    pub brand: String,
    pub broker: BrokerConfig,
    /// Base64-encoded 32-byte key for encrypting plugin config secrets.
    /// When absent an ephemeral key is generated (encrypted values then do
    /// not survive a restart), which is logged loudly.
    pub config_encryption_key: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing environment variable {key}"),
            ConfigError::Invalid { key, message } => {
                write!(f, "invalid value for {key}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl PlatformConfig {
    /// Load from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            base_url: optional("BASE_URL").unwrap_or_else(|| "http://localhost:3000".into()),
            internal_url: optional("INTERNAL_URL").unwrap_or_else(|| "http://localhost:7007".into()),
            brand: optional("BRAND").unwrap_or_else(|| "plinth".into()),
            broker: BrokerConfig {
                host: optional("BROKER_HOST").unwrap_or_else(|| "localhost".into()),
                port: parsed("BROKER_PORT", 6379)?,
                password: optional("BROKER_PASSWORD"),
                db: parsed("BROKER_DB", 0)?,
                timeout_secs: parsed("BROKER_TIMEOUT_SECS", 5)?,
            },
            config_encryption_key: optional("CONFIG_ENCRYPTION_KEY"),
        })
    }
}
