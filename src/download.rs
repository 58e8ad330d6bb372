//! Filter downloads into staging files.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempPath;

use crate::error::{Error, Result};
use crate::filter::FilterDescriptor;
use crate::parse;

/// Default HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches filter data from HTTP(S) URLs or local absolute paths.
///
/// Downloaded data is validated while it streams into a temporary file in the
/// filter directory, so the final rename into place stays on one filesystem.
pub struct Downloader {
    agent: ureq::Agent,
    filter_dir: PathBuf,
}

impl Downloader {
    /// Create a downloader with its own agent using `timeout`.
    pub fn new(filter_dir: &Path, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self::with_agent(filter_dir, agent)
    }

    /// Create a downloader around an existing agent.
    pub fn with_agent(filter_dir: &Path, agent: ureq::Agent) -> Self {
        Self {
            agent,
            filter_dir: filter_dir.to_path_buf(),
        }
    }

    /// Download `filter` into a staging file.
    ///
    /// Returns `None` when the server answered 304 Not Modified. On success
    /// `rule_count`, `last_updated` and (for HTTP) `last_modified` are updated
    /// on `filter`. A transport failure sets `network_error` on `filter`.
    /// The staging file is deleted when the returned path is dropped.
    pub fn fetch(&self, filter: &mut FilterDescriptor) -> Result<Option<TempPath>> {
        log::debug!("Downloading filter from {}", filter.url);
        filter.network_error = false;

        let reader: Box<dyn Read> = if Path::new(&filter.url).is_absolute() {
            Box::new(File::open(&filter.url)?)
        } else {
            match self.request(filter)? {
                Some(reader) => reader,
                None => {
                    filter.last_updated = Some(SystemTime::now());
                    return Ok(None);
                }
            }
        };

        let mut staging = tempfile::Builder::new()
            .prefix(&format!("{}.", filter.id))
            .suffix(".tmp")
            .tempfile_in(&self.filter_dir)?;
        let rules = parse::write_filter(reader, staging.as_file_mut())?;
        staging.as_file().sync_all()?;

        filter.rule_count = rules;
        filter.last_updated = Some(SystemTime::now());
        // Drops the handle before the caller renames the file
        Ok(Some(staging.into_temp_path()))
    }

    /// Download `filter` straight to its cache file.
    pub fn fetch_into_cache(&self, filter: &mut FilterDescriptor) -> Result<()> {
        let Some(staged) = self.fetch(filter)? else {
            return Ok(());
        };
        let path = filter.cache_path(&self.filter_dir);
        staged.persist(&path).map_err(|e| Error::Io(e.error))?;
        log::info!(
            "Saved filter {} at {:?}: {} rules",
            filter.url,
            path,
            filter.rule_count
        );
        Ok(())
    }

    /// Conditional GET. `None` means the server reported no change.
    fn request(&self, filter: &mut FilterDescriptor) -> Result<Option<Box<dyn Read>>> {
        let mut request = self.agent.get(&filter.url);
        if !filter.last_modified.is_empty() {
            request = request.set("If-Modified-Since", &filter.last_modified);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(Error::HttpStatus {
                    url: filter.url.clone(),
                    status,
                });
            }
            Err(ureq::Error::Transport(t)) => {
                filter.network_error = true;
                return Err(Error::Network {
                    url: filter.url.clone(),
                    source: Box::new(t),
                });
            }
        };

        match response.status() {
            304 => {
                log::debug!(
                    "Filter {} isn't modified since {}",
                    filter.url,
                    filter.last_modified
                );
                Ok(None)
            }
            200 => {
                filter.last_modified = response
                    .header("Last-Modified")
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(response.into_reader()))
            }
            status => Err(Error::HttpStatus {
                url: filter.url.clone(),
                status,
            }),
        }
    }
}
