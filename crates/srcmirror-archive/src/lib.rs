//! Archive backends and the task-ordered archive host.
//!
//! The building blocks:
//!
//! - [`mapping::NameMapping`] flattens source trees into collision-safe
//!   artifact names inside a single archive directory.
//! - [`task_manager::TaskManager`] serializes archive mutations in
//!   submission order and reports readiness edges.
//! - [`store::Archive`] hosts an [`store::ArchiveStore`] backend behind
//!   the task manager and emits change events.
//! - [`last_modified::LastModifiedStore`] archives modification
//!   timestamps only; [`generator::GeneratorStore`] archives generated
//!   artifacts, one per source file.

pub mod generator;
pub mod last_modified;
pub mod mapping;
pub mod store;
pub mod task_manager;

pub use generator::{Generator, GeneratorStore};
pub use last_modified::LastModifiedStore;
pub use mapping::NameMapping;
pub use store::{Archive, ArchiveStore};
pub use task_manager::TaskManager;
