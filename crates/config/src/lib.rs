use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default on-disk location of the hub configuration.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Display name announced in `system.started` events.
    pub name: String,
    /// Directory all engine state files are resolved against.
    pub data_dir: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "nerva-hub".to_string(),
            data_dir: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Events emitted before the listener is up are buffered here; the oldest
    /// entry is dropped once the cap is reached.
    pub pending_queue_cap: usize,
    /// Per-client outbound frame buffer. A client whose buffer is full has
    /// frames dropped for it alone.
    pub client_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            pending_queue_cap: 1024,
            client_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Snapshot file, rewritten wholesale after every mutating call.
    pub state_file: String,
    /// Audit log ring-buffer cap; oldest entries are trimmed past this.
    pub audit_cap: usize,
    /// Path prefixes that may never receive a grant (case-insensitive match).
    pub exclusion_zones: Vec<String>,
    /// TTL for `allow_session` sessions, in seconds.
    pub allow_session_ttl_secs: u64,
    /// TTL for `allow_action_session` sessions, in seconds.
    pub allow_action_session_ttl_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            state_file: "permissions.json".to_string(),
            audit_cap: 1000,
            exclusion_zones: vec![
                "/etc".to_string(),
                "/usr".to_string(),
                "C:\\Windows".to_string(),
                "C:\\Program Files".to_string(),
            ],
            allow_session_ttl_secs: 3600,
            allow_action_session_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub state_file: String,
    /// Rolling window size; the oldest entry falls off past this.
    pub max_window_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            state_file: "context-window.json".to_string(),
            max_window_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotesConfig {
    /// Directory structured note files are stored under.
    pub notes_dir: String,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            notes_dir: "chaos_files".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hub: HubConfig,
    pub gateway: GatewayConfig,
    pub permissions: PermissionsConfig,
    pub context: ContextConfig,
    pub notes: NotesConfig,
}

impl AppConfig {
    /// Load from `NERVA_CONFIG` if set, else [`DEFAULT_CONFIG_PATH`] if it
    /// exists, else built-in defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var("NERVA_CONFIG") {
            return Self::load_from(path);
        }
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Self::load_from(DEFAULT_CONFIG_PATH);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.port, 8765);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert!(config.permissions.audit_cap > 0);
        assert!(!config.permissions.exclusion_zones.is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[gateway]\nport = 9100\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 9100);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.context.max_window_size, 100);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.permissions.exclusion_zones = vec!["/locked".to_string()];
        config.save_to(&path).unwrap();

        let back = AppConfig::load_from(&path).unwrap();
        assert_eq!(back.permissions.exclusion_zones, vec!["/locked"]);
    }
}
