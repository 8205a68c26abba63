//! Monitoring and sync engine for public-account feeds.
//!
//! Sources are fetched through an ordered chain of fallback strategies,
//! merged into a deduplicated per-source item store, and re-synced on
//! recurring timers. See [`monitor::Monitor`] for the outer surface.

pub mod config;
pub mod feed;
pub mod monitor;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::Config;
pub use monitor::{Monitor, SyncTrigger};
