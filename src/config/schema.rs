//! Configuration schema for Dalec
//!
//! Configuration is stored at `~/.config/dalec/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    /// Build engine settings
    pub engine: EngineConfig,

    pub cache: CacheConfig,

    /// Per-target settings, keyed by target name (e.g. `jammy`)
    pub targets: BTreeMap<String, TargetConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Podman binary to execute
    pub podman: String,

    /// Snapshot directory, defaults to the user data dir
    pub state_dir: Option<PathBuf>,

    /// Podman network for execs that allow network access
    pub network: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            podman: "podman".to_string(),
            state_dir: None,
            network: None,
        }
    }
}

/// Cache volume settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix of persistent cache volume names
    pub volume_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            volume_prefix: "dalec-cache-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Replaces the distro's default worker image
    pub worker_image: Option<String>,
}

impl Config {
    /// Directory holding engine snapshots
    pub fn state_dir(&self) -> PathBuf {
        self.engine.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dalec")
        })
    }

    /// Worker image override for `target`
    pub fn worker_image(&self, target: &str) -> Option<&str> {
        self.targets
            .get(target)
            .and_then(|t| t.worker_image.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[engine]"));
        assert!(toml.contains("volume_prefix = \"dalec-cache-\""));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [engine]
            state_dir = "/var/tmp/dalec"

            [targets.jammy]
            worker_image = "registry.local/jammy-worker:1"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.podman, "podman");
        assert_eq!(config.state_dir(), PathBuf::from("/var/tmp/dalec"));
        assert_eq!(config.worker_image("jammy"), Some("registry.local/jammy-worker:1"));
        assert_eq!(config.worker_image("noble"), None);
    }
}
