//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Runtime configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// LINE channel access token (Bearer auth for the Messaging API).
    pub channel_access_token: SecretString,
    /// LINE channel secret (webhook signature verification).
    pub channel_secret: SecretString,
    /// Path to the local database file.
    pub db_path: PathBuf,
    /// Path to the message catalog JSON file.
    pub messages_path: PathBuf,
    /// Webhook server port.
    pub port: u16,
    /// Fire-loop cadence.
    pub tick_interval: Duration,
    /// Delivery attempts per job before it is marked failed.
    pub max_attempts: u32,
    /// Use second-scale campaign offsets instead of day-scale ones.
    pub demo_timings: bool,
    /// Provision the rich menu at startup.
    pub rich_menu: bool,
    /// Optional rich menu image to upload after creation.
    pub rich_menu_image: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let channel_access_token = require_env("LINE_CHANNEL_ACCESS_TOKEN")?;
        let channel_secret = require_env("LINE_CHANNEL_SECRET")?;

        let db_path = std::env::var("DRIPLINE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/dripline.db"));

        let messages_path = std::env::var("DRIPLINE_MESSAGES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./messages.json"));

        let port = parse_env("DRIPLINE_PORT", 8080)?;
        let tick_secs: u64 = parse_env("DRIPLINE_TICK_SECS", 5)?;
        let max_attempts: u32 = parse_env("DRIPLINE_MAX_ATTEMPTS", 8)?;

        Ok(Self {
            channel_access_token: SecretString::from(channel_access_token),
            channel_secret: SecretString::from(channel_secret),
            db_path,
            messages_path,
            port,
            tick_interval: Duration::from_secs(tick_secs),
            max_attempts,
            demo_timings: bool_env("DRIPLINE_DEMO_TIMINGS"),
            rich_menu: bool_env("DRIPLINE_RICH_MENU"),
            rich_menu_image: std::env::var("DRIPLINE_RICH_MENU_IMAGE")
                .ok()
                .map(PathBuf::from),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn bool_env(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        let port: u16 = parse_env("DRIPLINE_TEST_UNSET_PORT", 8080).unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn bool_env_unset_is_false() {
        assert!(!bool_env("DRIPLINE_TEST_UNSET_FLAG"));
    }
}
