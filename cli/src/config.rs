//! Configuration for the winback CLI.
//!
//! Loaded from a TOML file: a `[log]` table, the state file used by the JSON
//! repository, and the backup profiles with their pairs.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use winback_engine::{BackupProfile, EngineError, ProfileId};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// JSON state file for snapshots and run history.
    /// Relative paths are resolved against the config file's directory.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub profiles: Vec<BackupProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_state_file() -> PathBuf {
    PathBuf::from("winback-state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        if config.state_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.state_file = dir.join(&config.state_file);
            }
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let mut profile_ids = HashSet::new();
        for profile in &self.profiles {
            if !profile_ids.insert(profile.id) {
                return Err(EngineError::Config(format!("duplicate profile id {}", profile.id)));
            }
            if profile.volume_id.trim().is_empty() {
                return Err(EngineError::Config(format!("profile {} has no volume_id", profile.id)));
            }

            let mut pair_ids = HashSet::new();
            for pair in &profile.pairs {
                if !pair_ids.insert(pair.id) {
                    return Err(EngineError::Config(format!(
                        "duplicate pair id {} in profile {}",
                        pair.id, profile.id
                    )));
                }
                if !pair.source_path.is_absolute() {
                    return Err(EngineError::Config(format!(
                        "source path of pair {} must be absolute: {}",
                        pair.id,
                        pair.source_path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn profile(&self, id: ProfileId) -> anyhow::Result<&BackupProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .with_context(|| format!("no profile with id {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winback_engine::{BackupStrategy, ChecksumAlgorithm};

    fn absolute(name: &str) -> String {
        std::env::temp_dir().join(name).display().to_string()
    }

    #[test]
    fn test_defaults() {
        let toml = format!(
            r#"
[[profiles]]
id = 1
volume_id = "vol-1"

[[profiles.pairs]]
id = 1
source_path = '{}'
"#,
            absolute("docs")
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.state_file, PathBuf::from("winback-state.json"));

        let profile = config.profile(1).unwrap();
        assert_eq!(profile.strategy, BackupStrategy::Mirror);
        assert_eq!(profile.retention_days, 30);
        assert!(profile.use_volume_snapshot);
        assert!(!profile.verify_hash);
        assert_eq!(profile.hash_algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(profile.insertion_delay_secs, 3);
        assert!(profile.auto_start);
        assert!(profile.is_active);
        assert!(profile.pairs[0].is_active);
        assert!(profile.pairs[0].exclude_patterns.is_empty());
    }

    #[test]
    fn test_full_profile() {
        let toml = format!(
            r#"
state_file = "state/winback.json"

[log]
level = "debug"

[[profiles]]
id = 4
name = "Samsung T7"
volume_id = "vol-4"
strategy = "recycle-bin"
retention_days = 14
verify_hash = true
hash_algorithm = "blake3"

[[profiles.pairs]]
id = 1
source_path = '{}'
dest_relative_path = "Documents"
exclude_patterns = ["*.tmp", "~$*"]
"#,
            absolute("docs")
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.log.level, "debug");
        let profile = config.profile(4).unwrap();
        assert_eq!(profile.name, "Samsung T7");
        assert_eq!(profile.strategy, BackupStrategy::RecycleBin);
        assert_eq!(profile.retention_days, 14);
        assert_eq!(profile.hash_algorithm, ChecksumAlgorithm::Blake3);
        assert_eq!(profile.pairs[0].dest_relative_path, PathBuf::from("Documents"));
        assert_eq!(profile.pairs[0].exclude_patterns.len(), 2);
    }

    #[test]
    fn test_duplicate_profile_ids_rejected() {
        let toml = r#"
[[profiles]]
id = 1
volume_id = "a"

[[profiles]]
id = 1
volume_id = "b"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate profile id"));
    }

    #[test]
    fn test_duplicate_pair_ids_rejected() {
        let toml = format!(
            r#"
[[profiles]]
id = 1
volume_id = "a"

[[profiles.pairs]]
id = 2
source_path = '{0}'

[[profiles.pairs]]
id = 2
source_path = '{0}'
"#,
            absolute("x")
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_relative_source_rejected() {
        let toml = r#"
[[profiles]]
id = 1
volume_id = "a"

[[profiles.pairs]]
id = 1
source_path = "relative/dir"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_negative_retention_rejected() {
        let toml = r#"
[[profiles]]
id = 1
volume_id = "a"
retention_days = -1
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let toml = r#"
[[profiles]]
id = 1
volume_id = "a"
strategy = "shred"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_state_file_resolved_next_to_config() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("winback.toml");
        std::fs::write(&path, "state_file = \"state.json\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.state_file, dir.path().join("state.json"));
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }
}
