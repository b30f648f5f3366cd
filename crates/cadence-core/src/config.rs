use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ErrorCode;

/// Engine settings read from `<root>/.cadence/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Background threads running child cascades.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending child cascades accepted before `submit` starts rejecting.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Deepest inclusion level a child cascade may reach.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub children_in_background: bool,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_depth: default_max_depth(),
            children_in_background: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Internal identities skip the authorizer entirely.
    #[serde(default = "default_true")]
    pub system_bypass: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            system_bypass: default_true(),
        }
    }
}

/// Load `.cadence/config.toml` under `root`, or defaults when it is absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_engine_config(root: &Path) -> Result<EngineConfig> {
    let path = root.join(".cadence/config.toml");
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<EngineConfig>(&content).with_context(|| {
        format!(
            "{} ({}): failed to parse {}",
            ErrorCode::ConfigParseError.message(),
            ErrorCode::ConfigParseError,
            path.display()
        )
    })?;

    tracing::debug!(path = %path.display(), ?config, "loaded engine config");
    Ok(config)
}

const fn default_true() -> bool {
    true
}

const fn default_ttl_secs() -> u64 {
    60
}

const fn default_workers() -> usize {
    2
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_max_depth() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) {
        let path = dir.path().join(".cadence");
        std::fs::create_dir_all(&path).expect("create .cadence");
        std::fs::write(path.join("config.toml"), body).expect("write config");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = load_engine_config(dir.path()).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.cascade.workers, 2);
        assert_eq!(config.cascade.queue_capacity, 64);
        assert!(config.cascade.children_in_background);
        assert!(config.permissions.system_bypass);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        write_config(
            &dir,
            r"
[cascade]
workers = 4
children_in_background = false
",
        );
        let config = load_engine_config(dir.path()).expect("load");
        assert_eq!(config.cascade.workers, 4);
        assert!(!config.cascade.children_in_background);
        assert_eq!(config.cascade.max_depth, 64);
        assert_eq!(config.cache.ttl_secs, 60);
    }

    #[test]
    fn parse_error_names_the_code_and_file() {
        let dir = TempDir::new().expect("tempdir");
        write_config(&dir, "[cache]\nttl_secs = \"soon\"\n");
        let err = load_engine_config(dir.path()).expect_err("should fail");
        let msg = format!("{err:#}");
        assert!(msg.contains("E1001"), "{msg}");
        assert!(msg.contains("config.toml"), "{msg}");
    }
}
