//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::clock::DEFAULT_FILE_NAME;
use crate::backend::loopback::LoopbackOptions;
use crate::handle::DEFAULT_MAX_HANDLES;
use crate::publisher::DEFAULT_REFRESH_INTERVAL;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Values every mount inherits unless it overrides them
    #[serde(default)]
    pub defaults: MountDefaults,

    pub mounts: Vec<RawMountConfig>,
}

/// Top-level `defaults:` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MountDefaults {
    /// TTL attached to lookup/create/mkdir replies
    #[serde(with = "humantime_serde")]
    pub entry_timeout: Duration,

    /// TTL attached to getattr/setattr replies
    #[serde(with = "humantime_serde")]
    pub attr_timeout: Duration,

    pub read_only: bool,

    /// Let users other than the mounting user access the mount
    pub allow_other: bool,
}

impl Default for MountDefaults {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            read_only: false,
            allow_other: false,
        }
    }
}

/// Raw mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    pub backend: BackendConfig,

    #[serde(default, with = "humantime_serde")]
    pub entry_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub attr_timeout: Option<Duration>,

    pub read_only: Option<bool>,

    pub allow_other: Option<bool>,
}

/// Backend selection (tagged enum)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Single synthetic file holding the current time
    Clock(ClockConfig),

    /// Passthrough to a host directory
    Loopback(LoopbackConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "default_clock_file_name")]
    pub file_name: String,

    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

fn default_clock_file_name() -> String {
    DEFAULT_FILE_NAME.to_string()
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            file_name: default_clock_file_name(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackConfig {
    /// Host directory to mirror
    pub root: PathBuf,

    #[serde(default)]
    pub case_insensitive: bool,

    /// Allow renaming the volume (macOS)
    #[serde(default)]
    pub volname: bool,

    /// Report backup and creation times (macOS)
    #[serde(default)]
    pub xtimes: bool,

    #[serde(default = "default_max_handles")]
    pub max_handles: usize,
}

fn default_max_handles() -> usize {
    DEFAULT_MAX_HANDLES
}

impl LoopbackConfig {
    pub fn options(&self) -> LoopbackOptions {
        LoopbackOptions {
            case_insensitive: self.case_insensitive,
            volname: self.volname,
            xtimes: self.xtimes,
            max_handles: self.max_handles,
        }
    }
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Mount points (fully resolved)
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mount point configuration (resolved)
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub path: PathBuf,
    pub backend: BackendConfig,
    pub entry_timeout: Duration,
    pub attr_timeout: Duration,
    pub read_only: bool,
    pub allow_other: bool,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount overrides with defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            defaults,
            mounts,
        } = self;

        let mounts = mounts
            .into_iter()
            .map(|raw| Self::resolve_mount(&defaults, raw))
            .collect();

        Ok(Config { logging, mounts })
    }

    fn resolve_mount(defaults: &MountDefaults, raw: RawMountConfig) -> MountConfig {
        MountConfig {
            path: raw.path,
            backend: raw.backend,
            entry_timeout: raw.entry_timeout.unwrap_or(defaults.entry_timeout),
            attr_timeout: raw.attr_timeout.unwrap_or(defaults.attr_timeout),
            read_only: raw.read_only.unwrap_or(defaults.read_only),
            allow_other: raw.allow_other.unwrap_or(defaults.allow_other),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount point is required".to_string(),
            ));
        }

        let mut paths = std::collections::HashSet::new();
        for mount in &self.mounts {
            if !paths.insert(&mount.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount path: {:?}",
                    mount.path
                )));
            }
        }

        for mount in &self.mounts {
            match &mount.backend {
                BackendConfig::Clock(clock) => {
                    if clock.file_name.is_empty() || clock.file_name.contains('/') {
                        return Err(ConfigError::ValidationError(format!(
                            "Mount {:?}: clock file_name must be a non-empty name without '/'",
                            mount.path
                        )));
                    }
                    if clock.refresh_interval.is_zero() {
                        return Err(ConfigError::ValidationError(format!(
                            "Mount {:?}: clock refresh_interval must be greater than zero",
                            mount.path
                        )));
                    }
                }
                BackendConfig::Loopback(lb) => {
                    if !lb.root.is_absolute() {
                        return Err(ConfigError::ValidationError(format!(
                            "Mount {:?}: loopback root {:?} must be an absolute path",
                            mount.path, lb.root
                        )));
                    }
                    if lb.max_handles == 0 {
                        return Err(ConfigError::ValidationError(format!(
                            "Mount {:?}: loopback max_handles must be at least 1",
                            mount.path
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug

defaults:
  entry_timeout: 2s
  attr_timeout: 500ms
  allow_other: true

mounts:
  - path: /mnt/clock
    backend:
      type: clock
  - path: /mnt/loop
    attr_timeout: 0s
    read_only: true
    backend:
      type: loopback
      root: /srv/data
      case_insensitive: true
      max_handles: 128
"#;

        let config = Config::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.mounts.len(), 2);

        let clock = &config.mounts[0];
        assert_eq!(clock.entry_timeout, Duration::from_secs(2));
        assert_eq!(clock.attr_timeout, Duration::from_millis(500));
        assert!(clock.allow_other);
        assert!(!clock.read_only);
        match &clock.backend {
            BackendConfig::Clock(c) => {
                assert_eq!(c.file_name, "clock.txt");
                assert_eq!(c.refresh_interval, Duration::from_millis(250));
            }
            _ => panic!("Expected clock backend"),
        }

        // Second mount overrides attr_timeout and read_only, inherits the rest
        let lb = &config.mounts[1];
        assert_eq!(lb.entry_timeout, Duration::from_secs(2));
        assert_eq!(lb.attr_timeout, Duration::ZERO);
        assert!(lb.read_only);
        assert!(lb.allow_other);
        match &lb.backend {
            BackendConfig::Loopback(l) => {
                assert_eq!(l.root, PathBuf::from("/srv/data"));
                let options = l.options();
                assert!(options.case_insensitive);
                assert!(!options.volname);
                assert_eq!(options.max_handles, 128);
            }
            _ => panic!("Expected loopback backend"),
        }
    }

    #[test]
    fn test_defaults_section_is_optional() {
        let yaml = r#"
mounts:
  - path: /mnt/clock
    backend:
      type: clock
      file_name: now
      refresh_interval: 1s
"#;
        let config = Config::from_str(yaml).unwrap();
        let mount = &config.mounts[0];
        assert_eq!(mount.entry_timeout, Duration::from_secs(1));
        assert_eq!(mount.attr_timeout, Duration::from_secs(1));
        assert_eq!(config.logging.level, "info");
        match &mount.backend {
            BackendConfig::Clock(c) => {
                assert_eq!(c.file_name, "now");
                assert_eq!(c.refresh_interval, Duration::from_secs(1));
            }
            _ => panic!("Expected clock backend"),
        }
    }

    #[test]
    fn test_unknown_backend_is_parse_error() {
        let yaml = r#"
mounts:
  - path: /mnt/x
    backend:
      type: s3
"#;
        assert!(matches!(
            Config::from_str(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate_empty_mounts() {
        let config = Config {
            logging: LoggingConfig::default(),
            mounts: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_paths() {
        let yaml = r#"
mounts:
  - path: /mnt/a
    backend: { type: clock }
  - path: /mnt/a
    backend: { type: clock }
"#;
        let err = Config::from_str(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate mount path"), "{}", err);
    }

    #[test]
    fn test_validate_relative_loopback_root() {
        let yaml = r#"
mounts:
  - path: /mnt/a
    backend:
      type: loopback
      root: relative/dir
"#;
        let err = Config::from_str(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("absolute"), "{}", err);
    }

    #[test]
    fn test_validate_zero_max_handles() {
        let yaml = r#"
mounts:
  - path: /mnt/a
    backend:
      type: loopback
      root: /srv/data
      max_handles: 0
"#;
        let err = Config::from_str(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("max_handles"), "{}", err);
    }

    #[test]
    fn test_validate_clock_fields() {
        let yaml = r#"
mounts:
  - path: /mnt/a
    backend:
      type: clock
      file_name: a/b
"#;
        assert!(Config::from_str(yaml).unwrap().validate().is_err());

        let yaml = r#"
mounts:
  - path: /mnt/a
    backend:
      type: clock
      refresh_interval: 0s
"#;
        assert!(Config::from_str(yaml).unwrap().validate().is_err());
    }
}
