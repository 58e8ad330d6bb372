//! Filter descriptors and the flags reported around them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One remote or local rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilterDescriptor {
    /// Unique ID, also the cache file stem
    #[serde(default)]
    pub id: u64,
    /// Display name, unique across the registry
    pub name: String,
    /// HTTP(S) URL or absolute local path, unique across the registry
    pub url: String,
    /// Disabled filters are neither scheduled nor loaded
    #[serde(default)]
    pub enabled: bool,
    /// Time of the last successful sync
    #[serde(default, with = "system_time_serde")]
    pub last_updated: Option<SystemTime>,
    /// `Last-Modified` value from the previous download
    #[serde(default)]
    pub last_modified: String,
    /// Number of rule lines in the cached file
    #[serde(default)]
    pub rule_count: u64,

    /// Cache file path, resolved only on copies handed out by the storage
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub(crate) next_update: Option<SystemTime>,
    #[serde(skip)]
    pub(crate) network_error: bool,
}

impl FilterDescriptor {
    /// Create a descriptor for a new filter.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
            ..Default::default()
        }
    }

    /// Cache file path of this filter inside `filter_dir`.
    pub fn cache_path(&self, filter_dir: &Path) -> PathBuf {
        filter_dir.join(format!("{}.txt", self.id))
    }

    /// Whether the last download attempt failed at the transport level.
    pub fn network_error(&self) -> bool {
        self.network_error
    }

    /// Whether the filter is due for an update at `now`.
    pub(crate) fn is_due(&self, now: SystemTime) -> bool {
        self.enabled && self.next_update.map_or(true, |t| t <= now)
    }

    /// Copy with `path` resolved against `filter_dir`.
    pub(crate) fn resolved(&self, filter_dir: &Path) -> Self {
        let mut copy = self.clone();
        copy.path = self.cache_path(filter_dir);
        copy
    }
}

bitflags! {
    /// What a `modify` call changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeFlags: u32 {
        /// The enabled state was toggled
        const ENABLED = 1 << 0;
        /// The URL was replaced (and the filter re-downloaded)
        const URL = 1 << 1;
    }
}

/// Event delivered to observers around every apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateEvent {
    /// Cache files are about to be replaced
    BeforeUpdate,
    /// Cache files and metadata have been replaced
    AfterUpdate,
}

/// Unix seconds on the wire.
mod system_time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        time.map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(|s| UNIX_EPOCH + Duration::from_secs(s)))
    }
}
