//! Core types for the srcmirror system.
//!
//! This crate carries everything the archive and monitor crates share:
//! - [`MirrorError`] and the [`Result`] alias
//! - [`FileEvent`] and the [`Subscribers`] observer registry
//! - [`ReadyNotifier`] for edge-triggered busy/ready reporting
//! - [`StorageLayout`] and [`ScanConfig`]

pub mod config;
pub mod error;
pub mod events;

pub use config::{ScanConfig, StorageLayout};
pub use error::{MirrorError, Result};
pub use events::{FileEvent, FileEventKind, ReadyNotifier, Subscribers, Subscription};
