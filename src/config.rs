//! Store Configuration
//!
//! Everything is read from environment variables so the same binary runs
//! unchanged under any process supervisor.
//!
//! | Variable                 | Default     |
//! |--------------------------|-------------|
//! | `COORDINATOR_HOST`       | `localhost` |
//! | `COORDINATOR_PORT`       | `7147`      |
//! | `APP_SECRET`             | required    |
//! | `DATA_DIR`               | `data`      |
//! | `TICK_INTERVAL_MS`       | `100`       |
//! | `PUBLISH_INTERVAL_MS`    | `50`        |
//! | `SYNC_WRITES`            | `false`     |
//! | `MAX_RECONNECT_ATTEMPTS` | `10`        |
//!
//! Login providers come from the `AUTH_*` variables, see
//! [`AuthProviders::from_vars`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::network::auth::AuthProviders;

/// Default coordinator port.
pub const DEFAULT_COORDINATOR_PORT: u16 = 7147;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Store process configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Coordinator host name or address.
    pub coordinator_host: String,
    /// Coordinator port.
    pub coordinator_port: u16,
    /// Shared secret sent at registration.
    pub app_secret: String,
    /// Directory holding session journals.
    pub data_dir: PathBuf,
    /// Time between tick sweeps.
    pub tick_interval: Duration,
    /// Time between publish sweeps.
    pub publish_interval: Duration,
    /// `fsync` every journal append.
    pub sync_writes: bool,
    /// Reconnect attempts before giving up on the coordinator.
    pub max_reconnect_attempts: u32,
    /// Login providers announced at registration.
    pub auth: AuthProviders,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            coordinator_host: "localhost".to_string(),
            coordinator_port: DEFAULT_COORDINATOR_PORT,
            app_secret: String::new(),
            data_dir: PathBuf::from("data"),
            tick_interval: Duration::from_millis(100),
            publish_interval: Duration::from_millis(50),
            sync_writes: false,
            max_reconnect_attempts: 10,
            auth: AuthProviders::from_vars(|_| None),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Create config through a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let app_secret = var("APP_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("APP_SECRET"))?;

        let tick_ms = parse(&var, "TICK_INTERVAL_MS")?.unwrap_or(100u64);
        let publish_ms = parse(&var, "PUBLISH_INTERVAL_MS")?.unwrap_or(50u64);
        if tick_ms == 0 {
            return Err(invalid("TICK_INTERVAL_MS", "0"));
        }
        if publish_ms == 0 {
            return Err(invalid("PUBLISH_INTERVAL_MS", "0"));
        }

        Ok(Self {
            coordinator_host: var("COORDINATOR_HOST").unwrap_or(defaults.coordinator_host),
            coordinator_port: parse(&var, "COORDINATOR_PORT")?.unwrap_or(defaults.coordinator_port),
            app_secret,
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            tick_interval: Duration::from_millis(tick_ms),
            publish_interval: Duration::from_millis(publish_ms),
            sync_writes: parse_flag(&var, "SYNC_WRITES")?.unwrap_or(defaults.sync_writes),
            max_reconnect_attempts: parse(&var, "MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.max_reconnect_attempts),
            auth: AuthProviders::from_vars(&var),
        })
    }

    /// `host:port` of the coordinator.
    pub fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.coordinator_host, self.coordinator_port)
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| invalid(name, &raw)),
        None => Ok(None),
    }
}

fn parse_flag(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match var(name).as_deref() {
        Some("true") | Some("1") => Ok(Some(true)),
        Some("false") | Some("0") => Ok(Some(false)),
        Some(other) => Err(invalid(name, other)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StoreConfig::from_vars(vars(&[("APP_SECRET", "x")])).unwrap();
        assert_eq!(config.coordinator_addr(), "localhost:7147");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.publish_interval, Duration::from_millis(50));
        assert!(!config.sync_writes);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert!(config.auth.anonymous);
    }

    #[test]
    fn test_overrides() {
        let config = StoreConfig::from_vars(vars(&[
            ("APP_SECRET", "x"),
            ("COORDINATOR_HOST", "relay.internal"),
            ("COORDINATOR_PORT", "9000"),
            ("DATA_DIR", "/var/lib/store"),
            ("TICK_INTERVAL_MS", "20"),
            ("SYNC_WRITES", "1"),
            ("MAX_RECONNECT_ATTEMPTS", "3"),
            ("AUTH_NICKNAME", "true"),
        ]))
        .unwrap();
        assert_eq!(config.coordinator_addr(), "relay.internal:9000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/store"));
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert!(config.sync_writes);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(config.auth.nickname);
        assert!(!config.auth.anonymous);
    }

    #[test]
    fn test_missing_secret() {
        assert_eq!(
            StoreConfig::from_vars(vars(&[])).unwrap_err(),
            ConfigError::Missing("APP_SECRET")
        );
        assert_eq!(
            StoreConfig::from_vars(vars(&[("APP_SECRET", "")])).unwrap_err(),
            ConfigError::Missing("APP_SECRET")
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = StoreConfig::from_vars(vars(&[("APP_SECRET", "x"), ("COORDINATOR_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "COORDINATOR_PORT", .. }));

        let err = StoreConfig::from_vars(vars(&[("APP_SECRET", "x"), ("SYNC_WRITES", "yes")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SYNC_WRITES", .. }));

        let err = StoreConfig::from_vars(vars(&[("APP_SECRET", "x"), ("TICK_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "TICK_INTERVAL_MS", .. }));
    }
}
