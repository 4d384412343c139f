//! Configuration management for the task grabber service.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DEV_MODE` - Optional. Accept an `X-User-Id` header instead of a JWT. Defaults to `false`.
//! - `JWT_SECRET` - Required unless `DEV_MODE` is on. HMAC secret for bearer tokens.
//! - `JWT_TTL_DAYS` - Optional. Lifetime of issued tokens. Defaults to `30`.
//! - `DATA_DIR` - Optional. Where the database lives. Defaults to `./data`.
//! - `STORE_TYPE` - Optional. `sqlite` or `memory`. Defaults to `sqlite`.
//! - `UPLOAD_DIR` - Optional. Where proof images are written. Defaults to `$DATA_DIR/proofs`.
//! - `CLAIM_WINDOW_MINUTES` - Optional. Claim countdown. Defaults to `10`.
//! - `SWEEP_INTERVAL_SECS` - Optional. Expiry sweep period, `0` disables it. Defaults to `60`.
//! - `SUPERADMIN_ID` / `SUPERADMIN_NAME` - Optional. Bootstrap superadmin created at startup.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::marketplace::expiry::DEFAULT_CLAIM_WINDOW_MINUTES;
use crate::marketplace::StoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Token settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for signing JWTs
    pub jwt_secret: Option<String>,

    /// Token validity in days
    pub jwt_ttl_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_ttl_days: 30,
        }
    }
}

/// Superadmin ensured at startup.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub id: Uuid,
    pub name: String,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Identify callers by `X-User-Id` instead of a JWT
    pub dev_mode: bool,

    pub auth: AuthConfig,

    /// Directory holding the database
    pub data_dir: PathBuf,

    pub store_type: StoreType,

    /// Directory proof images are written to
    pub upload_dir: PathBuf,

    /// Claim countdown in minutes
    pub claim_window_minutes: i64,

    /// Seconds between expiry sweeps (0 = disabled)
    pub sweep_interval_secs: u64,

    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env("PORT", 3000u16)?;

        let dev_mode = env_var_bool("DEV_MODE", false);

        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if jwt_secret.is_none() && !dev_mode {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }
        let jwt_ttl_days = parse_env("JWT_TTL_DAYS", 30i64)?;
        if jwt_ttl_days < 1 {
            return Err(ConfigError::InvalidValue(
                "JWT_TTL_DAYS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let store_type = std::env::var("STORE_TYPE")
            .map(|s| StoreType::from_str(&s))
            .unwrap_or_default();

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("proofs"));

        let claim_window_minutes = parse_env("CLAIM_WINDOW_MINUTES", DEFAULT_CLAIM_WINDOW_MINUTES)?;
        if claim_window_minutes < 1 {
            return Err(ConfigError::InvalidValue(
                "CLAIM_WINDOW_MINUTES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let sweep_interval_secs = parse_env("SWEEP_INTERVAL_SECS", 60u64)?;

        let bootstrap_admin = match std::env::var("SUPERADMIN_ID") {
            Ok(raw) => {
                let id = Uuid::parse_str(raw.trim())
                    .map_err(|e| ConfigError::InvalidValue("SUPERADMIN_ID".to_string(), e.to_string()))?;
                let name = std::env::var("SUPERADMIN_NAME").unwrap_or_else(|_| "superadmin".to_string());
                Some(BootstrapAdmin { id, name })
            }
            Err(_) => None,
        };

        Ok(Self {
            host,
            port,
            dev_mode,
            auth: AuthConfig {
                jwt_secret,
                jwt_ttl_days,
            },
            data_dir,
            store_type,
            upload_dir,
            claim_window_minutes,
            sweep_interval_secs,
            bootstrap_admin,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            dev_mode: true,
            auth: AuthConfig::default(),
            upload_dir: data_dir.join("proofs"),
            data_dir,
            store_type: StoreType::Memory,
            claim_window_minutes: DEFAULT_CLAIM_WINDOW_MINUTES,
            sweep_interval_secs: 0,
            bootstrap_admin: None,
        }
    }

    pub fn claim_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.claim_window_minutes)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}
