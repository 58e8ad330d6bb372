//! Background update passes.
//!
//! Two threads cooperate through a bounded signal queue:
//! - the timer thread requests a pass with a growing delay between requests
//!   (5 s doubling up to one hour), so a dead network doesn't cause a retry
//!   storm;
//! - the consumer thread is the only reader of the queue and the only place a
//!   pass runs, which keeps passes from overlapping.
//!
//! A pass downloads every due filter outside the registry lock, collects the
//! staged files, then swaps them in under a single lock acquisition.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, SystemTime};

use tempfile::TempPath;

use crate::filter::{FilterDescriptor, UpdateEvent};
use crate::storage::Shared;

/// Capacity of the signal queue.
pub(crate) const SIGNAL_QUEUE_CAPACITY: usize = 2;

/// First delay of the timer loop.
const INITIAL_PERIOD: Duration = Duration::from_secs(5);

/// Ceiling of the timer loop delay.
const MAX_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Retry delay for a filter whose download failed at the transport level.
pub(crate) const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Message on the signal queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Run an update pass
    Update,
    /// Stop the consumer thread
    Stop,
}

/// A filter fetched during a pass, waiting to be applied.
#[derive(Debug)]
pub(crate) struct StagedUpdate {
    /// Fetched copy of the descriptor
    pub filter: FilterDescriptor,
    /// Validated data, `None` if the server reported no change
    pub staged: Option<TempPath>,
}

/// Timer thread body. Returns when `stop` is signalled or dropped, or when the
/// consumer has gone away.
pub(crate) fn update_by_timer(shared: &Shared, signals: &SyncSender<Signal>, stop: &Receiver<()>) {
    let mut period = INITIAL_PERIOD;
    loop {
        let enabled = shared.update_interval_hours() != 0;
        if enabled {
            if signals.send(Signal::Update).is_err() {
                break;
            }
        } else {
            // Automatic updates are disabled, just recheck the setting
            period = MAX_PERIOD;
        }

        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if enabled {
            period = next_period(period);
        }
    }
    log::debug!("Filter update timer stopped");
}

/// Consumer thread body.
pub(crate) fn update_by_signal(shared: &Shared, signals: Receiver<Signal>) {
    for signal in signals.iter() {
        match signal {
            Signal::Update => shared.update_all(),
            Signal::Stop => break,
        }
    }
    log::debug!("Filter update consumer stopped");
}

fn next_period(period: Duration) -> Duration {
    (period * 2).min(MAX_PERIOD)
}

impl Shared {
    /// Run one update pass.
    ///
    /// Each due filter is downloaded under a freshly allocated ID so its
    /// staging file never clashes with a cache file. One filter failing does
    /// not stop the pass.
    pub(crate) fn update_all(&self) {
        log::debug!("Updating filters...");
        let interval = self.update_interval();
        let mut attempted = HashSet::new();
        let mut batch = Vec::new();

        loop {
            let candidate = self
                .registry
                .lock()
                .next_due(SystemTime::now(), interval, &attempted);
            let Some(original) = candidate else {
                break;
            };
            attempted.insert(original.url.clone());

            let mut fetched = original.clone();
            fetched.id = self.ids.next();
            match self.downloader.fetch(&mut fetched) {
                Ok(staged) => batch.push(StagedUpdate {
                    filter: fetched,
                    staged,
                }),
                Err(e) if e.is_network() => {
                    log::warn!("{}; retrying in {:?}", e, NETWORK_RETRY_DELAY);
                    let mut registry = self.registry.lock();
                    if let Some(live) = registry.find_mut(&original.url) {
                        live.next_update = Some(SystemTime::now() + NETWORK_RETRY_DELAY);
                        live.network_error = true;
                    }
                }
                Err(e) => log::warn!("Skipping filter {}: {}", original.url, e),
            }
        }

        self.apply_update(batch);
    }

    /// Swap staged files over the cache files and update metadata.
    ///
    /// Entries are matched by URL: a filter deleted or re-pointed while the
    /// pass was downloading no longer matches and its staged file is removed.
    pub(crate) fn apply_update(&self, batch: Vec<StagedUpdate>) {
        self.notify(UpdateEvent::BeforeUpdate);

        let mut updated = 0;
        {
            let mut registry = self.registry.lock();
            for StagedUpdate { filter, staged } in batch {
                let Some(live) = registry.find_mut(&filter.url) else {
                    log::debug!("Filter {} was removed during the update", filter.url);
                    if let Some(staged) = staged {
                        if let Err(e) = staged.close() {
                            log::error!("Failed to remove staged file: {}", e);
                        }
                    }
                    continue;
                };

                let path = live.cache_path(&self.filter_dir);
                live.network_error = false;
                match staged {
                    None => {
                        let now = filter.last_updated.unwrap_or_else(SystemTime::now);
                        match touch(&path, now) {
                            Ok(()) => live.last_updated = Some(now),
                            Err(e) => {
                                log::error!("Failed to touch {:?}: {}", path, e);
                                // Force a full download next time
                                live.last_modified.clear();
                            }
                        }
                    }
                    Some(staged) => match staged.persist(&path) {
                        Ok(()) => {
                            live.rule_count = filter.rule_count;
                            live.last_modified = filter.last_modified;
                            live.last_updated = filter.last_updated;
                            updated += 1;
                        }
                        Err(e) => log::error!("Failed to replace {:?}: {}", path, e.error),
                    },
                }
            }
        }

        if updated == 0 {
            log::debug!("No filters were updated");
        } else {
            log::info!("{} filters were updated", updated);
        }
        self.notify(UpdateEvent::AfterUpdate);
    }
}

/// Set the modification time of `path` without touching its content.
fn touch(path: &Path, time: SystemTime) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(time)
}
