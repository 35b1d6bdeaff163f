//! Environment-driven proxy configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8081";
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_CACHE_PREFIX: &str = "tillpoint";

/// Cache generation baked in at build time.
pub const BUILD_CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

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
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Origin requests are forwarded to, without a trailing slash.
    pub origin: String,
    pub cache_prefix: String,
    pub cache_version: String,
    /// SQLite file holding the cache generations; OS data dir when unset.
    pub db_path: Option<PathBuf>,
    /// Requests under this prefix are never cached.
    pub api_prefix: String,
    /// Assets fetched during install.
    pub precache: Vec<String>,
    /// Served to failed navigations; always precached.
    pub offline_page: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            origin: DEFAULT_ORIGIN.to_string(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_version: BUILD_CACHE_VERSION.to_string(),
            db_path: None,
            api_prefix: "/api".to_string(),
            precache: ["/", "/index.html", "/offline.html", "/manifest.json"]
                .into_iter()
                .map(String::from)
                .collect(),
            offline_page: "/offline.html".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get("TILLPOINT_PROXY_LISTEN") {
            config.listen = raw.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "TILLPOINT_PROXY_LISTEN",
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = get("TILLPOINT_PROXY_ORIGIN") {
            if !(raw.starts_with("http://") || raw.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    key: "TILLPOINT_PROXY_ORIGIN",
                    value: raw,
                    reason: "must be an http(s) URL".to_string(),
                });
            }
            config.origin = raw.trim_end_matches('/').to_string();
        }
        if let Some(version) = get("TILLPOINT_PROXY_CACHE_VERSION") {
            config.cache_version = version;
        }
        config.db_path = get("TILLPOINT_PROXY_DB").map(PathBuf::from);

        Ok(config)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_precache(mut self, assets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.precache = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Everything fetched during install: `precache` plus the offline page
    /// when the list leaves it out.
    pub fn precache_assets(&self) -> Vec<String> {
        let mut assets = self.precache.clone();
        if !assets.contains(&self.offline_page) {
            assets.push(self.offline_page.clone());
        }
        assets
    }

    pub fn static_cache_name(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.cache_version)
    }

    pub fn runtime_cache_name(&self) -> String {
        format!("{}-runtime-{}", self.cache_prefix, self.cache_version)
    }

    pub fn resolve_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("tillpoint")
                .join("proxy-cache.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_page_is_always_precached() {
        let config = ProxyConfig::default();
        assert_eq!(config.precache_assets(), config.precache);

        let config = ProxyConfig::default().with_precache(["/", "/app.js"]);
        assert_eq!(config.precache_assets(), ["/", "/app.js", "/offline.html"]);
    }

    #[test]
    fn cache_names_carry_prefix_and_version() {
        let config = ProxyConfig::default().with_cache_version("v7");
        assert_eq!(config.static_cache_name(), "tillpoint-static-v7");
        assert_eq!(config.runtime_cache_name(), "tillpoint-runtime-v7");
        assert_eq!(ProxyConfig::default().cache_version, BUILD_CACHE_VERSION);
    }

    #[test]
    fn reads_environment() {
        let config = ProxyConfig::from_lookup(|key| match key {
            "TILLPOINT_PROXY_LISTEN" => Some("0.0.0.0:9000".to_string()),
            "TILLPOINT_PROXY_ORIGIN" => Some("https://pos.example.com/".to_string()),
            "TILLPOINT_PROXY_CACHE_VERSION" => Some("2024-03".to_string()),
            "TILLPOINT_PROXY_DB" => Some("/tmp/proxy.db".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.origin, "https://pos.example.com");
        assert_eq!(config.cache_version, "2024-03");
        assert_eq!(config.resolve_db_path(), PathBuf::from("/tmp/proxy.db"));
        assert_eq!(DEFAULT_LISTEN.parse::<SocketAddr>().unwrap(), ProxyConfig::default().listen);
    }

    #[test]
    fn rejects_bad_values() {
        let err = ProxyConfig::from_lookup(|key| (key == "TILLPOINT_PROXY_LISTEN").then(|| "nowhere".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TILLPOINT_PROXY_LISTEN", .. }));

        let err = ProxyConfig::from_lookup(|key| (key == "TILLPOINT_PROXY_ORIGIN").then(|| "ftp://files".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TILLPOINT_PROXY_ORIGIN", .. }));
    }
}
