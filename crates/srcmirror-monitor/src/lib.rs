//! Source tree monitors.
//!
//! [`monitor::FileMonitor`] routes file changes into archives by
//! extension. [`scanning::DirectoryScanningMonitor`] feeds it by polling
//! an explicit directory list; [`watch::FsEventMonitor`] feeds it from
//! debounced file system notifications.

pub mod monitor;
pub mod scanning;
pub mod watch;

pub use monitor::{FileMonitor, FileSource};
pub use scanning::{DirectoryScanningMonitor, enumerate_directory};
pub use watch::{FsEventMonitor, WatchConfig, WatchEvent};
