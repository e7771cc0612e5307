//! Configuration builder
//!
//! Merges configuration from files and CLI arguments.

use crate::config::{Config, ConfigFile};
use crate::error::ConfigError;

use std::path::{Path, PathBuf};

/// Builder for merging configuration sources
pub struct ConfigBuilder {
    config: Config,
    source: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            source: None,
        }
    }

    /// Load configuration from a file
    ///
    /// An explicit path (from `--config` or `NVOC_CONFIG`) must exist;
    /// without one the default locations are searched and may all be
    /// absent.
    pub fn with_file(mut self, path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.map(Path::to_path_buf).or_else(ConfigFile::env_path);

        let loaded = match explicit {
            Some(path) => {
                let config = ConfigFile::load(&path)?;
                Some((path, config))
            }
            None => ConfigFile::load_default()?,
        };

        if let Some((path, config)) = loaded {
            self.config = config;
            self.source = Some(path);
        }
        Ok(self)
    }

    /// Override with CLI verbose flag
    pub fn with_verbose(mut self, verbose: Option<bool>) -> Self {
        if let Some(v) = verbose {
            self.config.general.verbose = v;
        }
        self
    }

    /// Override with CLI profile directory
    pub fn with_profiles_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(d) = dir {
            self.config.paths.profiles_dir = Some(d);
        }
        self
    }

    /// Override with CLI sampling interval
    pub fn with_interval_ms(mut self, interval: Option<u64>) -> Self {
        if let Some(i) = interval {
            self.config.sampler.interval_ms = i;
        }
        self
    }

    /// File the configuration came from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Build the final configuration
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
