//! Core data model for densitree.
//!
//! This crate provides the arena-backed file tree, its change events,
//! exclusion rules, configuration, and error types. The read-job engine
//! that populates the tree lives in `densitree-scan`.

mod config;
mod error;
mod event;
mod exclude;
mod node;
mod tree;

pub use config::{
    PkgSettings, ScanOptions, ScanOptionsBuilder, Settings, DEFAULT_MAX_PARALLEL_PROCESSES,
};
pub use error::ScanError;
pub use event::TreeEvent;
pub use exclude::{wildcard_to_regex, ExcludeRule, ExcludeRules, PatternSyntax};
pub use node::{DirNode, Node, NodeId, NodeKind, PkgMeta, ReadState};
pub use tree::Tree;
