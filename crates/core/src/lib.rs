//! schemavc core library.
//!
//! This crate provides version control for structured schema objects: a
//! content-addressed object store, refs with compare-and-swap updates, the
//! commit graph and merge-base computation, structural tree diffs, the object
//! dependency resolver, the three-way merge engine, and the conflict
//! resolution workflow.

pub mod config;
pub mod conflict;
pub mod db;
pub mod dependency;
pub mod diff;
pub mod errors;
pub mod graph;
pub mod merge_engine;
pub mod models;
pub mod ref_policy;
pub mod refs;
pub mod repository;
pub mod store;

// Re-exports for convenience.
pub use config::VcsConfig;
pub use conflict::ConflictResolver;
pub use db::Database;
pub use dependency::{Closure, ClosureEntry, DependencyResolver, Relation};
pub use diff::{Change, ChangeKind, DiffEngine};
pub use errors::CoreError;
pub use graph::CommitGraph;
pub use merge_engine::{MergeEngine, MergeOutcome, MergeState};
pub use models::{ConflictKind, ObjectId, ObjectKey, Resolution, Snapshot};
pub use refs::RefManager;
pub use repository::Repository;
pub use store::ObjectStore;
