/// Session configuration
/// Defaults, overridden by `<config dir>/coderoom/config.json` when present
use sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Result, RoomError, DEFAULT_ROOM_CONTENT};

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period before a local edit is written to the store
    pub debounce_ms: u64,

    /// Content a new room is created with
    pub default_content: String,

    /// Buffer shown until the room's first snapshot arrives
    pub loading_text: String,

    /// Origin used to build share links
    pub origin: String,

    /// Room server WebSocket endpoint
    pub server_url: String,

    /// Upper bound on a single store round trip
    pub request_timeout_ms: u64,

    pub sandbox: SandboxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            default_content: DEFAULT_ROOM_CONTENT.to_string(),
            loading_text: "// Loading...".to_string(),
            origin: "http://127.0.0.1:8080".to_string(),
            server_url: "ws://127.0.0.1:8080".to_string(),
            request_timeout_ms: 10_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        base.join("coderoom").join("config.json")
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&json)
            .map_err(|e| RoomError::ConfigError(format!("{}: {}", path.display(), e)))?;

        if config.debounce_ms == 0 {
            return Err(RoomError::ConfigError(
                "debounce_ms must be greater than zero".to_string(),
            ));
        }

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.debounce(), Duration::from_millis(300));
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "debounce_ms": 400, "sandbox": { "program": "/usr/local/bin/node" } }"#,
        )
        .unwrap();

        let config = SessionConfig::load_from(&path).unwrap();
        assert_eq!(config.debounce_ms, 400);
        assert_eq!(
            config.sandbox.program,
            Some(PathBuf::from("/usr/local/bin/node"))
        );
        assert_eq!(config.default_content, DEFAULT_ROOM_CONTENT);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SessionConfig::load_from(&path),
            Err(RoomError::ConfigError(_))
        ));

        std::fs::write(&path, r#"{ "debounce_ms": 0 }"#).unwrap();
        assert!(matches!(
            SessionConfig::load_from(&path),
            Err(RoomError::ConfigError(_))
        ));
    }
}
