//! Configuration file parsing for Drydock
//!
//! Parses `drydock.toml` configuration files using serde

use crate::error::{Error, Result};
use crate::jail::DEFAULT_BINDS;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG: &str = "drydock.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<DrydockConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: DrydockConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load `path`, or `drydock.toml` if it exists, or fall back to defaults
///
/// An explicitly named file must exist.
pub fn load_or_default(path: Option<&Path>) -> Result<DrydockConfig> {
    match path {
        Some(path) => load(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                load(default)
            } else {
                Ok(DrydockConfig::default())
            }
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrydockConfig {
    #[serde(default)]
    pub jail: JailSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub log: LogSettings,
}

impl DrydockConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for path in &self.jail.default_binds {
            if !path.is_absolute() {
                return Err(Error::ConfigValidation(format!(
                    "Default bind '{}' must be an absolute path",
                    path.display()
                )));
            }
        }

        for (host, inside) in &self.jail.binds {
            if !host.is_absolute() {
                return Err(Error::ConfigValidation(format!(
                    "Bind source '{}' must be an absolute path",
                    host.display()
                )));
            }
            if inside.components().any(|c| c == Component::ParentDir) {
                return Err(Error::ConfigValidation(format!(
                    "Bind target '{}' must not contain '..'",
                    inside.display()
                )));
            }
        }

        if self.log.level.parse::<log::LevelFilter>().is_err() {
            return Err(Error::ConfigValidation(format!(
                "Unknown log level: {}",
                self.log.level
            )));
        }

        Ok(())
    }
}

/// `[jail]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JailSettings {
    /// Paths bind mounted into every jail
    #[serde(default = "default_binds")]
    pub default_binds: Vec<PathBuf>,

    /// Extra binds, host path -> path inside the jail
    #[serde(default)]
    pub binds: BTreeMap<PathBuf, PathBuf>,
}

impl Default for JailSettings {
    fn default() -> Self {
        Self {
            default_binds: default_binds(),
            binds: BTreeMap::new(),
        }
    }
}

fn default_binds() -> Vec<PathBuf> {
    DEFAULT_BINDS.iter().map(PathBuf::from).collect()
}

/// `[runner]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Command timeout in seconds (0 = none)
    #[serde(default)]
    pub timeout: u64,

    /// Stream output line by line instead of printing it at the end
    #[serde(default)]
    pub stream: bool,
}

impl RunnerSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_empty_config() {
        let config: DrydockConfig = toml::from_str("").unwrap();
        assert_eq!(config.jail.default_binds, default_binds());
        assert!(config.jail.binds.is_empty());
        assert_eq!(config.runner.timeout(), None);
        assert!(!config.runner.stream);
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[jail]
default_binds = ["/dev", "/proc"]

[jail.binds]
"/var/cache/packages" = "/var/cache/packages"
"/etc/resolv.conf" = "etc/resolv.conf"

[runner]
timeout = 300
stream = true

[log]
level = "debug"
"#;

        let config: DrydockConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.jail.default_binds,
            vec![PathBuf::from("/dev"), PathBuf::from("/proc")]
        );
        assert_eq!(config.jail.binds.len(), 2);
        assert_eq!(
            config.jail.binds.keys().next().unwrap(),
            Path::new("/etc/resolv.conf")
        );
        assert_eq!(config.runner.timeout(), Some(Duration::from_secs(300)));
        assert!(config.runner.stream);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_default_binds() {
        let config: DrydockConfig = toml::from_str("[jail]\ndefault_binds = []\n").unwrap();
        assert!(config.jail.default_binds.is_empty());
    }

    #[test]
    fn test_relative_default_bind_error() {
        let config: DrydockConfig = toml::from_str("[jail]\ndefault_binds = [\"dev\"]\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_relative_bind_source_error() {
        let toml = r#"
[jail.binds]
"cache" = "/cache"
"#;
        let config: DrydockConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_escaping_bind_target_error() {
        let toml = r#"
[jail.binds]
"/cache" = "/../../etc"
"#;
        let config: DrydockConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not contain '..'"));
    }

    #[test]
    fn test_unknown_log_level_error() {
        let config: DrydockConfig = toml::from_str("[log]\nlevel = \"loud\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<DrydockConfig>("[runner]\nretries = 3\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runner]\ntimeout = 5").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.runner.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = load_or_default(Some(Path::new("/nonexistent/drydock.toml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[jail]\ndefault_binds = [\"relative\"]").unwrap();

        assert!(matches!(
            load(file.path()),
            Err(Error::ConfigValidation(_))
        ));
    }
}
