//! Session and relay configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config:
//!
//! ```toml
//! [session]
//! channel_prefix = "scribe-doc"
//! save_debounce_ms = 100
//! bootstrap_timeout_ms = 3000
//! persist = true
//!
//! [relay]
//! bind_addr = "127.0.0.1:9090"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::storage::StoreConfig;

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Channel name is `<channel_prefix>-<document_id>`.
    pub channel_prefix: String,
    /// Channel for sessions without a document id.
    pub default_channel: String,
    pub save_debounce_ms: u64,
    /// How long to wait for a state response before re-checking occupancy.
    pub bootstrap_timeout_ms: u64,
    /// Load from and save to storage.
    pub persist: bool,
    /// Write a pending save on stop instead of dropping it.
    pub flush_on_stop: bool,
    /// Fixed display name; random when absent.
    pub username: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "scribe-doc".into(),
            default_channel: "scribe-scratch".into(),
            save_debounce_ms: 100,
            bootstrap_timeout_ms: 3_000,
            persist: true,
            flush_on_stop: false,
            username: None,
        }
    }
}

impl SessionConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}

/// Relay server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Broadcast buffer per topic; slow subscribers lag past this.
    pub topic_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".into(),
            topic_capacity: 256,
        }
    }
}

/// A whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScribeConfig {
    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
}

impl ScribeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let cfg = ScribeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.session, SessionConfig::default());
        assert_eq!(cfg.relay, RelayConfig::default());
        assert_eq!(cfg.session.save_debounce(), Duration::from_millis(100));
        assert!(!cfg.session.flush_on_stop);
    }

    #[test]
    fn test_partial_override() {
        let cfg = ScribeConfig::from_toml_str(
            r#"
            [session]
            save_debounce_ms = 250
            username = "KindFox7"

            [relay]
            bind_addr = "0.0.0.0:7000"

            [store]
            path = "/tmp/scribe"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.session.save_debounce_ms, 250);
        assert_eq!(cfg.session.username.as_deref(), Some("KindFox7"));
        assert_eq!(cfg.session.channel_prefix, "scribe-doc");
        assert_eq!(cfg.relay.bind_addr, "0.0.0.0:7000");
        assert_eq!(cfg.relay.topic_capacity, 256);
        assert_eq!(cfg.store.path, std::path::PathBuf::from("/tmp/scribe"));
    }

    #[test]
    fn test_bad_type_rejected() {
        assert!(matches!(
            ScribeConfig::from_toml_str("[session]\npersist = \"yes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ScribeConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
