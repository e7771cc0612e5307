//! Configuration file loading
//!
//! Handles loading configuration from TOML files.

use crate::config::Config;
use crate::error::ConfigError;

use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "NVOC_CONFIG";

/// Configuration file handler
pub struct ConfigFile;

impl ConfigFile {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the first config file found in the default locations
    ///
    /// A file that exists but does not parse is an error rather than
    /// silently skipped, so a typo never falls back to defaults unnoticed.
    pub fn load_default() -> Result<Option<(PathBuf, Config)>, ConfigError> {
        for path in Self::default_paths() {
            if path.exists() {
                let config = Self::load(&path)?;
                log::info!("Loaded config from {}", path.display());
                return Ok(Some((path, config)));
            }
        }
        Ok(None)
    }

    /// Get default configuration file paths, most general first
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System-wide config
        paths.push(PathBuf::from("/etc/nvoc/config.toml"));

        // User config
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("nvoc").join("config.toml"));
        }

        // Current directory
        paths.push(PathBuf::from("nvoc.toml"));

        paths
    }

    /// Explicit path from `NVOC_CONFIG`, if set
    pub fn env_path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_paths_not_empty() {
        let paths = ConfigFile::default_paths();
        assert_eq!(paths[0], PathBuf::from("/etc/nvoc/config.toml"));
        assert!(paths.iter().any(|p| p.ends_with("nvoc.toml")));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigFile::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
escalation_command = ""

[paths]
profiles_dir = "/var/lib/nvoc/profiles"
"#,
        )
        .unwrap();

        let config = ConfigFile::load(&path).unwrap();
        assert_eq!(config.gateway.escalation_command, "");
        assert_eq!(
            config.paths.profiles_dir,
            Some(PathBuf::from("/var/lib/nvoc/profiles"))
        );
    }

    #[test]
    fn test_load_invalid_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampler]\ninterval_ms = 0\n").unwrap();

        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampler\n").unwrap();

        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::TomlError(_))
        ));
    }
}
