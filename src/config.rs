//! Storage configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::FilterDescriptor;

/// Default update interval in hours.
pub const DEFAULT_UPDATE_INTERVAL_HOURS: u32 = 24;

/// Default HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Configuration for a [`FilterStorage`](crate::FilterStorage).
///
/// The storage never writes this back to disk itself; the embedding
/// application fetches a snapshot with `write_config` and persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one `<id>.txt` file per filter
    pub filter_dir: PathBuf,
    /// Hours between automatic updates; 0 disables them
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: u32,
    /// Timeout for a single HTTP download
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Registered filters in display order; an ID of 0 gets a fresh one
    #[serde(default)]
    pub filters: Vec<FilterDescriptor>,
}

fn default_update_interval_hours() -> u32 {
    DEFAULT_UPDATE_INTERVAL_HOURS
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

impl Config {
    /// Create a configuration with defaults and no filters.
    pub fn new(filter_dir: impl Into<PathBuf>) -> Self {
        Self {
            filter_dir: filter_dir.into(),
            update_interval_hours: DEFAULT_UPDATE_INTERVAL_HOURS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            filters: Vec::new(),
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Update interval as a duration.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_interval_hours) * 3600)
    }

    /// HTTP timeout as a duration.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.filter_dir.as_os_str().is_empty() {
            return Err(Error::Config("filter_dir must not be empty".to_string()));
        }
        for (i, f) in self.filters.iter().enumerate() {
            let dup = self.filters[..i]
                .iter()
                .any(|g| g.name == f.name || g.url == f.url || (f.id != 0 && g.id == f.id));
            if dup {
                return Err(Error::Config(format!(
                    "duplicate filter name, URL or ID: {}",
                    f.url
                )));
            }
        }
        Ok(())
    }
}
