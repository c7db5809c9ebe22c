//! Aggregated configuration, loadable from JSON.
//!
//! Every section and field is optional; anything missing takes its
//! default. Durations are written as milliseconds:
//!
//! ```json
//! {
//!   "presence": { "heartbeat_interval": 30000, "active_timeout": 300000 },
//!   "cursor":   { "throttle": 100, "smoothing": 0.15 },
//!   "store":    { "path": "/var/lib/cobrief" }
//! }
//! ```

use std::path::Path;

use cobrief_core::{CollabError, EngineConfig, Result};
use serde::{Deserialize, Serialize};

use crate::cursor::CursorConfig;
use crate::follow::FollowConfig;
use crate::hub::HubConfig;
use crate::presence::PresenceConfig;
use crate::storage::StoreConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub presence: PresenceConfig,
    pub cursor: CursorConfig,
    pub follow: FollowConfig,
    pub engine: EngineConfig,
    pub hub: HubConfig,
    /// Persistence is off unless a store section is given.
    pub store: Option<StoreConfig>,
}

impl CollabConfig {
    pub fn for_testing() -> Self {
        Self {
            presence: PresenceConfig::for_testing(),
            cursor: CursorConfig::for_testing(),
            follow: FollowConfig::for_testing(),
            engine: EngineConfig::for_testing(),
            hub: HubConfig::for_testing(),
            store: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Storage(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_json_is_default() {
        let config = CollabConfig::from_json("{}").unwrap();
        assert_eq!(config, CollabConfig::default());
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.presence.active_timeout, Duration::from_secs(300));
        assert_eq!(config.cursor.throttle, Duration::from_millis(100));
        assert_eq!(config.follow.debounce, Duration::from_millis(500));
        assert!(config.store.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let json = r#"{
            "presence": { "heartbeat_interval": 5000 },
            "cursor": { "smoothing": 0.3, "trail_length": 4 },
            "store": { "path": "/tmp/briefs" }
        }"#;
        let config = CollabConfig::from_json(json).unwrap();
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.presence.active_timeout, Duration::from_secs(300));
        assert_eq!(config.cursor.smoothing, 0.3);
        assert_eq!(config.cursor.trail_length, 4);
        assert_eq!(config.cursor.throttle, Duration::from_millis(100));

        let store = config.store.unwrap();
        assert_eq!(store.path, Path::new("/tmp/briefs"));
        assert_eq!(store.bloom_filter_bits, StoreConfig::default().bloom_filter_bits);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = CollabConfig::for_testing();
        let back = CollabConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_malformed_json() {
        let err = CollabConfig::from_json("{ presence: ").unwrap_err();
        assert!(matches!(err, CollabError::Serialization(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collab.json");
        std::fs::write(&path, r#"{ "follow": { "debounce": 250 } }"#).unwrap();
        let config = CollabConfig::load(&path).unwrap();
        assert_eq!(config.follow.debounce, Duration::from_millis(250));

        assert!(CollabConfig::load(dir.path().join("missing.json")).is_err());
    }
}
