//! Filter storage: registry, public operations and lifecycle.

use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::filter::{ChangeFlags, FilterDescriptor, UpdateEvent};
use crate::id::IdAllocator;
use crate::parse;
use crate::registry::Registry;
use crate::scheduler::{self, Signal, SIGNAL_QUEUE_CAPACITY};

/// Callback invoked around every apply.
///
/// Observers run synchronously on the update thread, in registration order.
/// A slow observer delays the next pass; one that never returns stalls
/// updates for good. Observers must not register further observers.
pub type Observer = Box<dyn Fn(UpdateEvent) + Send + Sync>;

/// State shared between the public handle and the update threads.
pub(crate) struct Shared {
    pub(crate) filter_dir: PathBuf,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) ids: IdAllocator,
    pub(crate) downloader: Downloader,
    update_interval_hours: AtomicU32,
    http_timeout_secs: u64,
    observers: RwLock<Vec<Observer>>,
}

impl Shared {
    pub(crate) fn update_interval_hours(&self) -> u32 {
        self.update_interval_hours.load(Ordering::Relaxed)
    }

    pub(crate) fn update_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_interval_hours()) * 3600)
    }

    pub(crate) fn notify(&self, event: UpdateEvent) {
        for observer in self.observers.read().iter() {
            observer(event);
        }
    }

    /// Count the rules of every enabled filter that has a cache file.
    ///
    /// A filter whose file is unreadable keeps a rule count of zero and stays
    /// due, so the next pass downloads it again.
    fn load_cached(&self) {
        let interval = self.update_interval();
        let mut registry = self.registry.lock();
        for filter in registry.iter_mut() {
            let path = filter.cache_path(&self.filter_dir);
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("No cached data for {} at {:?}: {}", filter.url, path, e);
                    continue;
                }
            };
            filter.last_updated = Some(modified);
            if !filter.enabled {
                continue;
            }

            match File::open(&path)
                .map_err(Error::from)
                .and_then(parse::count_rules)
            {
                Ok(rules) => {
                    filter.rule_count = rules;
                    filter.next_update = Some(modified + interval);
                    log::debug!("Loaded filter {}: {} rules", filter.url, rules);
                }
                Err(e) => {
                    log::error!("Failed to load filter {:?}: {}", path, e);
                    filter.rule_count = 0;
                }
            }
        }
    }
}

struct Tasks {
    timer: JoinHandle<()>,
    consumer: JoinHandle<()>,
    /// Dropping this wakes the timer thread and stops it
    timer_stop: Sender<()>,
}

/// Local mirror of remote filter lists.
///
/// Keeps one validated `<id>.txt` file per filter in the filter directory and
/// refreshes them in the background. Cache files are only ever replaced by a
/// rename of a fully validated staging file, so readers never see a partial or
/// invalid list.
///
/// # Example
///
/// ```ignore
/// use k2filter::{Config, FilterDescriptor, FilterStorage, UpdateEvent};
///
/// let storage = FilterStorage::new(Config::new("/var/lib/k2filter/filters"));
/// storage.add_observer(|event| {
///     if event == UpdateEvent::AfterUpdate {
///         println!("filters changed");
///     }
/// });
/// storage.start()?;
///
/// storage.add(FilterDescriptor::new(
///     "AdGuard DNS filter",
///     "https://adguardteam.github.io/AdGuardSDNSFilter/Filters/filter.txt",
/// ))?;
///
/// for filter in storage.list() {
///     println!("{} {:?} {} rules", filter.name, filter.path, filter.rule_count);
/// }
///
/// storage.close();
/// ```
pub struct FilterStorage {
    pub(crate) shared: Arc<Shared>,
    signals: SyncSender<Signal>,
    /// Taken by the consumer thread on `start`
    receiver: Mutex<Option<Receiver<Signal>>>,
    tasks: Mutex<Option<Tasks>>,
}

impl FilterStorage {
    /// Create a storage from `config` with its own HTTP agent.
    pub fn new(config: Config) -> Self {
        let downloader = Downloader::new(&config.filter_dir, config.http_timeout());
        Self::with_downloader(config, downloader)
    }

    /// Create a storage that downloads through `agent`.
    pub fn with_agent(config: Config, agent: ureq::Agent) -> Self {
        let downloader = Downloader::with_agent(&config.filter_dir, agent);
        Self::with_downloader(config, downloader)
    }

    fn with_downloader(mut config: Config, downloader: Downloader) -> Self {
        let max_id = config.filters.iter().map(|f| f.id).max().unwrap_or(0);
        let ids = IdAllocator::after(max_id);
        for filter in config.filters.iter_mut().filter(|f| f.id == 0) {
            filter.id = ids.next();
        }

        let shared = Shared {
            filter_dir: config.filter_dir,
            registry: Mutex::new(Registry::new(config.filters)),
            ids,
            downloader,
            update_interval_hours: AtomicU32::new(config.update_interval_hours),
            http_timeout_secs: config.http_timeout_secs,
            observers: RwLock::new(Vec::new()),
        };
        let (signals, receiver) = mpsc::sync_channel(SIGNAL_QUEUE_CAPACITY);

        Self {
            shared: Arc::new(shared),
            signals,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(None),
        }
    }

    /// Directory holding the cache files.
    pub fn filter_dir(&self) -> &Path {
        &self.shared.filter_dir
    }

    /// Load cached filters and launch the update threads.
    ///
    /// Enabled filters with a cache file get their rule count from that file;
    /// nothing is downloaded here. Calling `start` on a running storage does
    /// nothing; a closed storage cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Ok(());
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return Err(Error::Config("filter storage was closed".to_string()));
        };

        fs::create_dir_all(&self.shared.filter_dir)?;
        self.shared.load_cached();

        let shared = Arc::clone(&self.shared);
        let consumer = thread::Builder::new()
            .name("k2filter-update".to_string())
            .spawn(move || scheduler::update_by_signal(&shared, receiver))?;

        let shared = Arc::clone(&self.shared);
        let signals = self.signals.clone();
        let (timer_stop, stop) = mpsc::channel();
        let timer = thread::Builder::new()
            .name("k2filter-timer".to_string())
            .spawn(move || scheduler::update_by_timer(&shared, &signals, &stop))?;

        *tasks = Some(Tasks {
            timer,
            consumer,
            timer_stop,
        });
        log::debug!("Filter storage started in {:?}", self.shared.filter_dir);
        Ok(())
    }

    /// Stop the update threads.
    ///
    /// Sends the stop signal and waits for both threads. A pass that is
    /// already running finishes first; its downloads are not interrupted.
    pub fn close(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        drop(tasks.timer_stop);
        if self.signals.send(Signal::Stop).is_err() {
            log::debug!("Filter update consumer already stopped");
        }
        for (name, handle) in [("timer", tasks.timer), ("update", tasks.consumer)] {
            if handle.join().is_err() {
                log::error!("Filter {} thread panicked", name);
            }
        }
        log::debug!("Filter storage closed");
    }

    /// Snapshot of all filters with `path` resolved.
    pub fn list(&self) -> Vec<FilterDescriptor> {
        let registry = self.shared.registry.lock();
        registry
            .iter()
            .map(|f| f.resolved(&self.shared.filter_dir))
            .collect()
    }

    /// Register and download a new filter.
    ///
    /// The download happens on the calling thread without holding the
    /// registry lock. On success the filter is enabled, its cache file exists
    /// and the stored descriptor is returned. On failure nothing changes.
    pub fn add(&self, filter: FilterDescriptor) -> Result<FilterDescriptor> {
        self.shared
            .registry
            .lock()
            .check_unique(&filter.name, &filter.url, None)?;

        let mut nf = FilterDescriptor {
            id: self.shared.ids.next(),
            enabled: true,
            last_modified: String::new(),
            rule_count: 0,
            path: PathBuf::new(),
            next_update: None,
            network_error: false,
            ..filter
        };
        if let Err(e) = self.shared.downloader.fetch_into_cache(&mut nf) {
            log::debug!("Failed to add filter {}: {}", nf.url, e);
            return Err(e);
        }
        nf.next_update = Some(SystemTime::now() + self.shared.update_interval());

        let mut registry = self.shared.registry.lock();
        if let Err(e) = registry.check_unique(&nf.name, &nf.url, None) {
            // Lost a race against a concurrent add
            drop(registry);
            remove_file(&nf.cache_path(&self.shared.filter_dir));
            return Err(e);
        }
        let added = nf.resolved(&self.shared.filter_dir);
        registry.push(nf);
        log::info!("Added filter {}", added.url);
        Ok(added)
    }

    /// Remove a filter from the registry.
    ///
    /// Returns the removed descriptor with `path` resolved; deleting the
    /// cache file is up to the caller.
    pub fn delete(&self, url: &str) -> Option<FilterDescriptor> {
        let removed = self.shared.registry.lock().remove(url)?;
        log::debug!("Removed filter {}", url);
        Some(removed.resolved(&self.shared.filter_dir))
    }

    /// Rename, enable/disable or re-point a filter.
    ///
    /// A new URL gets a new ID and is downloaded from scratch. Re-enabling a
    /// filter reuses its cache file if that still validates and downloads it
    /// otherwise. If a required download fails the registry is left exactly
    /// as it was and the error is returned.
    ///
    /// Returns what changed and the descriptor as it was before the call
    /// (with `path` resolved, so the caller can drop an abandoned file).
    pub fn modify(
        &self,
        url: &str,
        enabled: bool,
        name: &str,
        new_url: &str,
    ) -> Result<(ChangeFlags, FilterDescriptor)> {
        let backup = {
            let registry = self.shared.registry.lock();
            let current = registry
                .find(url)
                .cloned()
                .ok_or_else(|| Error::NotFound(url.to_string()))?;
            registry.check_unique(name, new_url, Some(url))?;
            current
        };

        let mut updated = backup.clone();
        let mut flags = ChangeFlags::empty();
        updated.name = name.to_string();
        if updated.enabled != enabled {
            updated.enabled = enabled;
            flags |= ChangeFlags::ENABLED;
        }
        if updated.url != new_url {
            updated.url = new_url.to_string();
            flags |= ChangeFlags::URL;
        }

        let mut need_download = false;
        let mut reparsed = false;
        if flags.contains(ChangeFlags::URL) {
            updated.id = self.shared.ids.next();
            need_download = true;
        } else if flags.contains(ChangeFlags::ENABLED) && enabled {
            match self.reload_cached(&mut updated) {
                Ok(()) => reparsed = true,
                Err(e) => {
                    log::debug!("Cached data for {} unusable: {}", url, e);
                    need_download = true;
                }
            }
        }

        if need_download {
            updated.last_modified.clear();
            updated.rule_count = 0;
            self.shared.downloader.fetch_into_cache(&mut updated)?;
            updated.next_update = Some(SystemTime::now() + self.shared.update_interval());
        }

        let mut registry = self.shared.registry.lock();
        let committed = match registry.find(url) {
            None => Err(Error::NotFound(url.to_string())),
            // Another add or modify may have claimed the name or URL meanwhile
            Some(_) => registry.check_unique(&updated.name, &updated.url, Some(url)),
        };
        if let Err(e) = committed {
            drop(registry);
            if need_download {
                remove_file(&updated.cache_path(&self.shared.filter_dir));
            }
            return Err(e);
        }
        let Some(live) = registry.find_mut(url) else {
            return Err(Error::NotFound(url.to_string()));
        };

        live.name = updated.name;
        live.enabled = updated.enabled;
        if need_download {
            live.id = updated.id;
            live.url = updated.url;
            live.last_modified = updated.last_modified;
            live.last_updated = updated.last_updated;
            live.rule_count = updated.rule_count;
            live.next_update = updated.next_update;
            live.network_error = false;
        } else if reparsed {
            live.rule_count = updated.rule_count;
        }

        log::debug!("Modified filter {}: {:?}", url, flags);
        Ok((flags, backup.resolved(&self.shared.filter_dir)))
    }

    /// Make every filter due and request an update pass.
    ///
    /// Blocks while two requests are already queued and the update thread is
    /// busy.
    pub fn refresh(&self) {
        self.shared.registry.lock().reset_schedule();
        if self.signals.send(Signal::Update).is_err() {
            log::warn!("Filter update requested after close");
        }
    }

    /// Register an observer, see [`Observer`].
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(UpdateEvent) + Send + Sync + 'static,
    {
        self.shared.observers.write().push(Box::new(observer));
    }

    /// Take over the update interval from `config`.
    pub fn set_config(&self, config: &Config) {
        self.shared
            .update_interval_hours
            .store(config.update_interval_hours, Ordering::Relaxed);
    }

    /// Snapshot of the current configuration for persistence.
    pub fn write_config(&self) -> Config {
        let filters = self.shared.registry.lock().to_vec();
        Config {
            filter_dir: self.shared.filter_dir.clone(),
            update_interval_hours: self.shared.update_interval_hours(),
            http_timeout_secs: self.shared.http_timeout_secs,
            filters,
        }
    }

    /// Recount the rules of an existing cache file.
    ///
    /// The file is validated like a download, so a damaged file leads to a
    /// fresh download instead of being served again.
    fn reload_cached(&self, filter: &mut FilterDescriptor) -> Result<()> {
        let file = File::open(filter.cache_path(&self.shared.filter_dir))?;
        filter.rule_count = parse::write_filter(file, io::sink())?;
        Ok(())
    }
}

impl Drop for FilterStorage {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Failed to remove {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tempfile::{tempdir, TempDir};

    fn storage(dir: &TempDir) -> FilterStorage {
        let mut config = Config::new(dir.path().join("filters"));
        config.update_interval_hours = 0;
        fs::create_dir_all(&config.filter_dir).unwrap();
        FilterStorage::new(config)
    }

    fn source(dir: &TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_ids_follow_configured_filters() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        let mut filter = FilterDescriptor::new("future", "https://a.example/list.txt");
        filter.id = u64::from(u32::MAX) * 4;
        config.filters.push(filter);

        let storage = FilterStorage::new(config);
        assert!(storage.shared.ids.next() > u64::from(u32::MAX) * 4);
    }

    #[test]
    fn test_missing_ids_assigned() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.filters.push(FilterDescriptor::new("A", "https://a.example/list.txt"));
        config.filters.push(FilterDescriptor::new("B", "https://b.example/list.txt"));

        let list = FilterStorage::new(config).list();
        assert_ne!(list[0].id, 0);
        assert!(list[1].id > list[0].id);
    }

    #[test]
    fn test_start_loads_enabled_filters() {
        let dir = tempdir().unwrap();
        let filter_dir = dir.path().join("filters");
        fs::create_dir_all(&filter_dir).unwrap();
        fs::write(filter_dir.join("10.txt"), "# c\n||a.com^\n||b.com^").unwrap();
        fs::write(filter_dir.join("11.txt"), "||c.com^\n").unwrap();

        let mut enabled = FilterDescriptor::new("A", "https://a.example/list.txt");
        enabled.id = 10;
        let mut disabled = FilterDescriptor::new("B", "https://b.example/list.txt");
        disabled.id = 11;
        disabled.enabled = false;
        let mut missing = FilterDescriptor::new("C", "https://c.example/list.txt");
        missing.id = 12;

        let mut config = Config::new(&filter_dir);
        config.update_interval_hours = 0;
        config.filters = vec![enabled, disabled, missing];
        let storage = FilterStorage::new(config);
        storage.start().unwrap();

        let list = storage.list();
        assert_eq!(list[0].rule_count, 2);
        assert!(list[0].last_updated.is_some());
        assert_eq!(list[1].rule_count, 0);
        assert!(list[1].last_updated.is_some());
        assert!(list[2].last_updated.is_none());
        assert_eq!(list[2].path, filter_dir.join("12.txt"));

        storage.close();
        assert!(matches!(storage.start(), Err(Error::Config(_))));
    }

    #[test]
    fn test_add_duplicate() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let url = source(&dir, "a.txt", "||a.com^\n");
        storage.add(FilterDescriptor::new("A", &url)).unwrap();

        let other = source(&dir, "b.txt", "||b.com^\n");
        assert!(matches!(
            storage.add(FilterDescriptor::new("A", &other)),
            Err(Error::Duplicate)
        ));
        assert!(matches!(
            storage.add(FilterDescriptor::new("B", &url)),
            Err(Error::Duplicate)
        ));
        assert_eq!(storage.list().len(), 1);
    }

    #[test]
    fn test_modify_rename_and_disable() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let url = source(&dir, "a.txt", "||a.com^\n");
        let added = storage.add(FilterDescriptor::new("A", &url)).unwrap();

        let (flags, previous) = storage.modify(&url, false, "Renamed", &url).unwrap();
        assert_eq!(flags, ChangeFlags::ENABLED);
        assert_eq!(previous.name, "A");
        assert!(previous.enabled);

        let current = &storage.list()[0];
        assert_eq!(current.name, "Renamed");
        assert!(!current.enabled);
        assert_eq!(current.id, added.id);
    }

    #[test]
    fn test_modify_not_found() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let err = storage
            .modify("https://none.example/", true, "x", "https://none.example/")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_modify_reenable_revalidates_cache() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let url = source(&dir, "a.txt", "||a.com^\n");
        let added = storage.add(FilterDescriptor::new("A", &url)).unwrap();
        storage.modify(&url, false, "A", &url).unwrap();

        // Damaged cache file and an updated source: the source is fetched again
        fs::write(&added.path, b"\x00garbage").unwrap();
        fs::write(&url, "||a.com^\n||b.com^\n").unwrap();
        storage.modify(&url, true, "A", &url).unwrap();

        let current = &storage.list()[0];
        assert_eq!(current.rule_count, 2);
        assert_eq!(fs::read_to_string(&current.path).unwrap(), "||a.com^\n||b.com^\n");
    }

    #[test]
    fn test_modify_new_url_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let url = source(&dir, "a.txt", "||a.com^\n");
        storage.add(FilterDescriptor::new("A", &url)).unwrap();
        let before = storage.list();

        let bad = source(&dir, "bad.txt", "<!DOCTYPE html><html></html>");
        let err = storage.modify(&url, true, "A", &bad).unwrap_err();
        assert!(matches!(err, Error::HtmlContent));
        assert_eq!(storage.list(), before);
        assert_eq!(fs::read_dir(storage.filter_dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_refresh_blocks_when_queue_full() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(storage(&dir));

        // Not started: nothing drains the queue
        storage.refresh();
        storage.refresh();

        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let storage = Arc::clone(&storage);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                storage.refresh();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!done.load(Ordering::SeqCst));

        let receiver = storage.receiver.lock().take().unwrap();
        assert_eq!(receiver.recv().unwrap(), Signal::Update);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(receiver.try_iter().count(), 2);
    }

    #[test]
    fn test_write_and_set_config() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir);
        let url = source(&dir, "a.txt", "||a.com^\n");
        storage.add(FilterDescriptor::new("A", &url)).unwrap();

        let mut config = storage.write_config();
        assert_eq!(config.update_interval_hours, 0);
        assert_eq!(config.filters.len(), 1);
        assert_eq!(config.filters[0].rule_count, 1);

        config.update_interval_hours = 6;
        storage.set_config(&config);
        assert_eq!(storage.write_config().update_interval_hours, 6);
    }
}
