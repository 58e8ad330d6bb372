//! K2Filter - an always-usable local mirror of remote filter lists.
//!
//! This crate keeps cached copies of block/allow rule lists (as used by DNS
//! and ad-blocking proxies) fresh, and swaps updated content into place
//! without ever leaving readers with a missing or corrupt file.
//!
//! # Features
//!
//! - **Registry**: ordered, thread-safe list of filters with unique names and URLs
//! - **Conditional downloads**: `If-Modified-Since` requests, 304 short-circuit
//! - **Streaming validation**: rejects binary and HTML payloads and counts rules
//!   in a single pass while writing the staging file
//! - **Atomic updates**: cache files are replaced by a same-directory rename
//! - **Background scheduling**: timer with exponential backoff, manual refresh,
//!   short retry after network failures
//! - **Observers**: callbacks before and after every update
//!
//! # Quick Start
//!
//! ```ignore
//! use k2filter::{Config, FilterDescriptor, FilterStorage};
//!
//! let storage = FilterStorage::new(Config::load("k2filter.yaml")?);
//! storage.start()?;
//!
//! storage.add(FilterDescriptor::new("Ads", "https://example.com/ads.txt"))?;
//! storage.refresh();
//!
//! // Persisting the configuration is up to the application
//! storage.write_config().save("k2filter.yaml")?;
//! storage.close();
//! ```
//!
//! # Cache Layout
//!
//! The filter directory holds one `<id>.txt` file per filter. Downloads are
//! staged as `<id>.<random>.tmp` next to them and renamed into place only
//! after validation succeeded.

mod config;
mod error;
mod filter;
mod id;
mod registry;
mod scheduler;
mod storage;

pub mod download;
pub mod parse;

// Re-export core types
pub use config::{Config, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_UPDATE_INTERVAL_HOURS};
pub use error::{Error, Result};
pub use filter::{ChangeFlags, FilterDescriptor, UpdateEvent};
pub use id::IdAllocator;

// Re-export the storage
pub use storage::{FilterStorage, Observer};
