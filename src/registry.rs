//! Ordered filter registry guarded by the storage lock.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::filter::FilterDescriptor;

/// Ordered list of filter descriptors.
///
/// Order is only meaningful for display. All access goes through the
/// storage's registry mutex; callers receive clones, never references that
/// outlive the lock.
#[derive(Debug, Default)]
pub struct Registry {
    filters: Vec<FilterDescriptor>,
}

impl Registry {
    pub fn new(filters: Vec<FilterDescriptor>) -> Self {
        Self { filters }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterDescriptor> {
        self.filters.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FilterDescriptor> {
        self.filters.iter_mut()
    }

    pub fn find(&self, url: &str) -> Option<&FilterDescriptor> {
        self.filters.iter().find(|f| f.url == url)
    }

    pub fn find_mut(&mut self, url: &str) -> Option<&mut FilterDescriptor> {
        self.filters.iter_mut().find(|f| f.url == url)
    }

    /// Fail with [`Error::Duplicate`] if any filter other than the one at
    /// `except_url` already uses `name` or `url`.
    pub fn check_unique(&self, name: &str, url: &str, except_url: Option<&str>) -> Result<()> {
        let collides = self
            .filters
            .iter()
            .filter(|f| Some(f.url.as_str()) != except_url)
            .any(|f| f.name == name || f.url == url);
        if collides {
            return Err(Error::Duplicate);
        }
        Ok(())
    }

    pub fn push(&mut self, filter: FilterDescriptor) {
        self.filters.push(filter);
    }

    /// Remove the filter with `url`, keeping the order of the rest.
    pub fn remove(&mut self, url: &str) -> Option<FilterDescriptor> {
        let pos = self.filters.iter().position(|f| f.url == url)?;
        Some(self.filters.remove(pos))
    }

    /// Pick the first enabled filter that is due and reschedule it.
    ///
    /// Filters whose URL is in `skip` were already attempted during the
    /// current pass and are passed over.
    pub fn next_due(
        &mut self,
        now: SystemTime,
        interval: Duration,
        skip: &HashSet<String>,
    ) -> Option<FilterDescriptor> {
        let filter = self
            .filters
            .iter_mut()
            .find(|f| f.is_due(now) && !skip.contains(&f.url))?;
        filter.next_update = Some(now + interval);
        Some(filter.clone())
    }

    /// Make every filter due.
    pub fn reset_schedule(&mut self) {
        for filter in &mut self.filters {
            filter.next_update = None;
        }
    }

    pub fn to_vec(&self) -> Vec<FilterDescriptor> {
        self.filters.clone()
    }
}
