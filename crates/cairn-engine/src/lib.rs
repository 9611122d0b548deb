//! cairn-engine: turns a directory into a snapshot and back
//!
//! # Overview
//! - `builder`: walks a source directory, chunks files and stores the tree
//! - `snapshot`: one backup pass per call, plus forget, gc and recount
//! - `reader`: lazy listing, walking, restore and diff of stored trees
//! - `report`: per-run counters and per-entry failures

pub mod builder;
pub mod reader;
pub mod report;
pub mod snapshot;

pub use builder::{BuiltTree, TreeBuilder};
pub use reader::{
    Change, ChangeKind, DirView, Found, RestoreOptions, TreeReader, TreeRoot, TreeWalker, WalkItem,
};
pub use report::{BuildReport, EntryFailure, RestoreReport};
pub use snapshot::{unix_seconds, CreatedSnapshot, RecountStats, SnapshotManager};
