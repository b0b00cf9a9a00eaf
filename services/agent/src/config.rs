//! Configuration for the agent.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tether_resource::{TimestampFormat, DEFAULT_HEARTBEAT_ANNOTATION};

use crate::heartbeat::{HeartbeatConfig, NotFoundPolicy};
use crate::watch::WatchConfig;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster API base URL (usually a `kubectl proxy`).
    pub api_url: String,

    /// Namespace to track and watch.
    pub namespace: String,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Annotation key holding the liveness timestamp.
    pub heartbeat_annotation: String,

    pub timestamp_format: TimestampFormat,

    /// End a heartbeat once its object is gone.
    pub stop_on_not_found: bool,

    /// Restrict the watch to one object name.
    pub watch_name: Option<String>,

    /// Existing objects to heartbeat.
    pub track: Vec<String>,

    /// Use the in-memory store instead of a cluster.
    pub memory: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            namespace: "default".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_annotation: DEFAULT_HEARTBEAT_ANNOTATION.to_string(),
            timestamp_format: TimestampFormat::Unix,
            stop_on_not_found: false,
            watch_name: None,
            track: Vec::new(),
            memory: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let api_url = lookup("TETHER_API_URL").unwrap_or(defaults.api_url);
        let namespace = lookup("TETHER_NAMESPACE").unwrap_or(defaults.namespace);

        let heartbeat_interval_secs = match lookup("TETHER_HEARTBEAT_INTERVAL") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("TETHER_HEARTBEAT_INTERVAL is not a number: {raw}"))?,
            None => defaults.heartbeat_interval_secs,
        };
        if heartbeat_interval_secs == 0 {
            bail!("TETHER_HEARTBEAT_INTERVAL must be greater than zero");
        }

        let heartbeat_annotation =
            lookup("TETHER_HEARTBEAT_ANNOTATION").unwrap_or(defaults.heartbeat_annotation);

        let timestamp_format = match lookup("TETHER_TIMESTAMP_FORMAT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("TETHER_TIMESTAMP_FORMAT: {e}"))?,
            None => defaults.timestamp_format,
        };

        let stop_on_not_found = lookup("TETHER_STOP_ON_NOT_FOUND")
            .map(|raw| parse_flag(&raw))
            .unwrap_or(defaults.stop_on_not_found);

        let watch_name = lookup("TETHER_WATCH_NAME").filter(|s| !s.trim().is_empty());

        let track = lookup("TETHER_TRACK")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let memory = lookup("TETHER_MEMORY").map(|raw| parse_flag(&raw)).unwrap_or(false);

        let log_level = lookup("TETHER_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            api_url,
            namespace,
            heartbeat_interval_secs,
            heartbeat_annotation,
            timestamp_format,
            stop_on_not_found,
            watch_name,
            track,
            memory,
            log_level,
        })
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            annotation: self.heartbeat_annotation.clone(),
            timestamp_format: self.timestamp_format,
            not_found: if self.stop_on_not_found {
                NotFoundPolicy::Stop
            } else {
                NotFoundPolicy::KeepRetrying
            },
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig::default()
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api_url, "http://127.0.0.1:8001");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.heartbeat_annotation, DEFAULT_HEARTBEAT_ANNOTATION);
        assert!(config.track.is_empty());
        assert!(!config.memory);
        assert_eq!(config.heartbeat_config(), HeartbeatConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TETHER_NAMESPACE", "edge"),
            ("TETHER_HEARTBEAT_INTERVAL", "5"),
            ("TETHER_TIMESTAMP_FORMAT", "rfc3339"),
            ("TETHER_STOP_ON_NOT_FOUND", "true"),
            ("TETHER_WATCH_NAME", "web"),
            ("TETHER_TRACK", "web, api,,db"),
            ("TETHER_MEMORY", "1"),
        ])
        .unwrap();

        assert_eq!(config.namespace, "edge");
        assert_eq!(config.watch_name.as_deref(), Some("web"));
        assert_eq!(config.track, vec!["web", "api", "db"]);
        assert!(config.memory);

        let heartbeat = config.heartbeat_config();
        assert_eq!(heartbeat.interval, Duration::from_secs(5));
        assert_eq!(heartbeat.timestamp_format, TimestampFormat::Rfc3339);
        assert_eq!(heartbeat.not_found, NotFoundPolicy::Stop);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("TETHER_HEARTBEAT_INTERVAL", "soon")]).is_err());
        assert!(load(&[("TETHER_HEARTBEAT_INTERVAL", "0")]).is_err());
        assert!(load(&[("TETHER_TIMESTAMP_FORMAT", "iso")]).is_err());
    }
}
