//! Environment-driven client configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::ReplayOrdering;
use crate::store::{StoreError, default_store_path};

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Lower bound for the connectivity probe period.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub auth_token: Option<String>,
    /// Directory holding `offline.db`; the OS data directory when unset.
    pub data_dir: Option<PathBuf>,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
    pub replay_ordering: ReplayOrdering,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            data_dir: None,
            probe_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            replay_ordering: ReplayOrdering::default(),
        }
    }
}

impl ClientConfig {
    /// Read `TILLPOINT_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("TILLPOINT_API_URL") {
            config.api_url = url;
        }
        config.auth_token = get("TILLPOINT_AUTH_TOKEN");
        config.data_dir = get("TILLPOINT_DATA_DIR").map(PathBuf::from);

        if let Some(raw) = get("TILLPOINT_PROBE_INTERVAL_SECS") {
            config.probe_interval = parse_secs("TILLPOINT_PROBE_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = get("TILLPOINT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("TILLPOINT_REQUEST_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("TILLPOINT_REPLAY_ORDERING") {
            config.replay_ordering = raw.parse::<ReplayOrdering>().map_err(|reason| ConfigError::Invalid {
                key: "TILLPOINT_REPLAY_ORDERING",
                value: raw.clone(),
                reason,
            })?;
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Periods below [`MIN_PROBE_INTERVAL`] are raised to it.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval.max(MIN_PROBE_INTERVAL);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_replay_ordering(mut self, ordering: ReplayOrdering) -> Self {
        self.replay_ordering = ordering;
        self
    }

    pub fn store_path(&self) -> Result<PathBuf, StoreError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.join("offline.db")),
            None => default_store_path(),
        }
    }
}

fn parse_secs(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.probe_interval, Duration::from_secs(30));
    }

    #[test]
    fn reads_every_variable() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("TILLPOINT_API_URL", "https://pos.example.com/api"),
            ("TILLPOINT_AUTH_TOKEN", "secret"),
            ("TILLPOINT_DATA_DIR", "/var/lib/tillpoint"),
            ("TILLPOINT_PROBE_INTERVAL_SECS", "5"),
            ("TILLPOINT_REQUEST_TIMEOUT_SECS", "3"),
            ("TILLPOINT_REPLAY_ORDERING", "per-entity"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "https://pos.example.com/api");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.store_path().unwrap(), PathBuf::from("/var/lib/tillpoint/offline.db"));
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.replay_ordering, ReplayOrdering::PerEntityBarrier);
    }

    #[test]
    fn zero_probe_interval_is_clamped() {
        let config = ClientConfig::default().with_probe_interval(Duration::ZERO);
        assert_eq!(config.probe_interval, MIN_PROBE_INTERVAL);

        let config = ClientConfig::default().with_probe_interval(Duration::from_millis(25));
        assert_eq!(config.probe_interval, Duration::from_millis(25));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = ClientConfig::from_lookup(lookup(&[("TILLPOINT_PROBE_INTERVAL_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TILLPOINT_PROBE_INTERVAL_SECS", .. }));

        let err = ClientConfig::from_lookup(lookup(&[("TILLPOINT_REQUEST_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TILLPOINT_REQUEST_TIMEOUT_SECS", .. }));

        let err = ClientConfig::from_lookup(lookup(&[("TILLPOINT_REPLAY_ORDERING", "chaos")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TILLPOINT_REPLAY_ORDERING", .. }));
    }
}
