//! Cooperative read-job engine for densitree.
//!
//! One [`JobQueue`] drives one [`Tree`](densitree_core::Tree). Seed it
//! with a local directory, a cache snapshot, or a package selection, and
//! tick it (or call [`JobQueue::run_to_completion`]) until every job is
//! done:
//!
//! ```no_run
//! use std::sync::Arc;
//! use densitree_core::{ExcludeRules, ScanOptions, Tree};
//! use densitree_scan::{JobQueue, MountTable};
//!
//! let mut tree = Tree::new();
//! let mut queue = JobQueue::new(
//!     ScanOptions::default(),
//!     Arc::new(ExcludeRules::default()),
//!     Arc::new(MountTable::from_system()),
//! );
//! queue.open_dir(&mut tree, std::path::Path::new("/tmp")).unwrap();
//! queue.run_to_completion(&mut tree);
//! ```

mod cache;
mod job;
mod local;
mod mounts;
mod pkg;
mod process;
mod queue;
mod sysutil;

pub use cache::{CacheReader, CacheWriter, DEFAULT_CACHE_NAME};
pub use job::JobId;
pub use local::stat_and_insert;
pub use mounts::{MountPoint, MountTable};
pub use pkg::{
    DpkgManager, PkgFilter, PkgInfo, PkgListEntry, PkgManager, PkgQuery, PkgReader, RpmManager,
};
pub use process::{ProcessEvent, ProcessOutcome, ProcessPool, ProcessSpec};
pub use queue::{JobQueue, QueueState};
pub use sysutil::{have_command, run_command, try_run_command};
