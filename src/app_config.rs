//! Application configuration.
//!
//! Every key can come from an optional TOML config file; command-line flags
//! override whatever the file supplied.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_true() -> bool {
    true
}

/// Runtime configuration of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Directory to mirror and index.
    pub source_directory: PathBuf,

    /// Mount point.
    pub target_directory: PathBuf,

    /// When set, the tracer is enabled and writes access logs here.
    pub access_log_directory: Option<PathBuf>,

    /// Index files during the initial scan, not just directories.
    pub record_file_access: bool,

    /// Cache metadata in the kernel (1 day timeouts) instead of none.
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Dispatch upcalls across a worker pool instead of a single thread.
    #[serde(default = "default_true")]
    pub multithreaded: bool,

    /// Widen the default log filter to debug level.
    pub debug: bool,

    /// Write the process ID here once the filesystem is mounted.
    pub pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::new(),
            target_directory: PathBuf::new(),
            access_log_directory: None,
            record_file_access: false,
            cache: true,
            multithreaded: true,
            debug: false,
            pid_file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Load from `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        debug!(path = %path.display(), "loading configuration file");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.source_directory.as_os_str().is_empty() {
            errors.push("source directory must be specified".to_owned());
        }
        if self.target_directory.as_os_str().is_empty() {
            errors.push("target directory must be specified".to_owned());
        }
        if let Some(dir) = &self.access_log_directory {
            if dir.as_os_str().is_empty() {
                errors.push("access log directory must not be empty when set".to_owned());
            }
        }
        if let Some(pid_file) = &self.pid_file {
            if pid_file.parent().is_none() {
                errors.push(format!(
                    "pid file path '{}' has no parent directory",
                    pid_file.display()
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cache_and_multithread() {
        let config = Config::default();
        assert!(config.cache);
        assert!(config.multithreaded);
        assert!(!config.record_file_access);
        assert!(config.access_log_directory.is_none());
    }

    #[test]
    fn validate_requires_source_and_target() {
        let config = Config::default();
        let errors = config.validate().expect_err("empty config is invalid");
        assert_eq!(errors.len(), 2, "both directories are missing: {errors:?}");
    }

    #[test]
    fn load_parses_kebab_case_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
source-directory = "/srv/tree"
target-directory = "/mnt/tree"
access-log-directory = "/var/log/peekfs"
record-file-access = true
cache = false
"#,
        )
        .expect("write config");

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.source_directory, PathBuf::from("/srv/tree"));
        assert_eq!(config.target_directory, PathBuf::from("/mnt/tree"));
        assert_eq!(
            config.access_log_directory,
            Some(PathBuf::from("/var/log/peekfs"))
        );
        assert!(config.record_file_access);
        assert!(!config.cache);
        assert!(config.multithreaded, "unset keys keep their defaults");
        config.validate().expect("loaded config is valid");
    }

    #[test]
    fn load_without_a_path_uses_defaults() {
        let config = Config::load(None).expect("defaults");
        assert!(config.source_directory.as_os_str().is_empty());
    }
}
