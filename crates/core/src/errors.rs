//! Error types for the schemavc core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ref(#[from] RefError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CoreError {
    /// `true` if the operation lost an optimistic compare-and-swap and may
    /// be retried after re-reading current state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ref(e) => e.is_retryable(),
            Self::Merge(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Object store errors
// ---------------------------------------------------------------------------

/// Errors from the content-addressed object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object is stored under the given id.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The object exists but is of a different kind than requested.
    #[error("object {id} is a {actual}, expected a {expected}")]
    KindMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// A tree entry name is empty or contains the key separator.
    #[error("invalid tree entry name '{0}'")]
    InvalidName(String),

    /// Two tree entries share the same name.
    #[error("duplicate tree entry name '{0}'")]
    DuplicateEntry(String),

    /// A stored payload could not be encoded or decoded.
    #[error("object encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored kind or timestamp column holds an unexpected value.
    #[error("corrupt object {id}: {detail}")]
    Corrupt { id: String, detail: String },

    /// Database error when reading or writing objects.
    #[error("object store database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Ref errors
// ---------------------------------------------------------------------------

/// Errors from the ref manager.
#[derive(Debug, Error)]
pub enum RefError {
    /// The ref does not exist.
    #[error("ref not found: {0}")]
    NotFound(String),

    /// A ref with this name already exists.
    #[error("ref '{0}' already exists")]
    AlreadyExists(String),

    /// Compare-and-swap lost: the ref no longer points at `expected`.
    #[error("concurrent update of ref '{name}': expected {expected}, found {actual}")]
    ConcurrentRefUpdate {
        name: String,
        expected: String,
        actual: String,
    },

    /// The ref matches a protected pattern and cannot be deleted.
    #[error("ref '{name}' is protected by pattern '{pattern}'")]
    Protected { name: String, pattern: String },

    /// Tags never move once created.
    #[error("tag '{0}' is immutable")]
    TagImmutable(String),

    /// The ref name is not acceptable.
    #[error("invalid ref name '{name}': {detail}")]
    InvalidName { name: String, detail: String },

    /// The ref target could not be validated.
    #[error("ref store error: {0}")]
    StoreError(#[from] StoreError),

    /// Database error when persisting refs.
    #[error("ref database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl RefError {
    /// `true` for compare-and-swap failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentRefUpdate { .. })
    }
}

impl From<rusqlite::Error> for RefError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Commit graph errors
// ---------------------------------------------------------------------------

/// Errors from the commit graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The two commits share no root history.
    #[error("no common ancestor between {a} and {b}")]
    NoCommonAncestor { a: String, b: String },

    /// A parent named by a new commit is not stored.
    #[error("parent commit {0} not found")]
    MissingParent(String),

    /// The tree named by a new commit is not stored.
    #[error("commit tree {0} not found")]
    MissingTree(String),

    /// Underlying object store error.
    #[error("commit graph store error: {0}")]
    StoreError(#[from] StoreError),

    /// Database error when walking the graph.
    #[error("commit graph database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl From<rusqlite::Error> for GraphError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Dependency errors
// ---------------------------------------------------------------------------

/// Errors from the dependency resolver.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// A traversal stopped at its depth bound with nodes left unexplored.
    /// Reported alongside a truncated result, never returned as a failure.
    #[error("dependency traversal from '{key}' exceeded max depth {max_depth}")]
    CyclicDependencyExceededDepth { key: String, max_depth: usize },

    /// An edge from a key to itself.
    #[error("self-referencing dependency edge on '{0}'")]
    SelfEdge(String),

    /// Unknown relation label read from storage.
    #[error("unknown dependency relation '{0}'")]
    UnknownRelation(String),

    /// Database error when reading or writing edges.
    #[error("dependency database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl From<rusqlite::Error> for DependencyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge engine and conflict resolution workflow.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The requested merge operation was not found.
    #[error("merge operation not found: {0}")]
    NotFound(String),

    /// The two heads have disjoint histories.
    #[error("no common ancestor between {source_head} and {target_head}")]
    NoCommonAncestor {
        source_head: String,
        target_head: String,
    },

    /// The target ref moved while the merge was prepared.
    #[error("target ref '{target_ref}' moved from {expected} to {actual}; recompute the merge")]
    ConcurrentRefUpdate {
        target_ref: String,
        expected: String,
        actual: String,
    },

    /// Finalize attempted while conflicts are still open.
    #[error("merge {merge_id} has {open} unresolved conflict(s)")]
    ConflictUnresolved { merge_id: String, open: usize },

    /// A batch resolution named keys that cannot all be resolved.
    #[error("invalid batch for merge {merge_id}: {detail}")]
    InvalidBatch { merge_id: String, detail: String },

    /// The key is not a conflict of this merge.
    #[error("no conflict on '{object_key}' in merge {merge_id}")]
    ConflictNotFound {
        merge_id: String,
        object_key: String,
    },

    /// Attempted to resolve a conflict that is no longer open.
    #[error("conflict on '{object_key}' is already {status}")]
    AlreadyResolved { object_key: String, status: String },

    /// A state-machine transition was invalid.
    #[error("invalid merge state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A stored merge status or conflict field holds an unexpected value.
    #[error("corrupt merge record {id}: {detail}")]
    Corrupt { id: String, detail: String },

    /// Underlying object store error.
    #[error("merge store error: {0}")]
    StoreError(#[from] StoreError),

    /// Underlying ref error.
    #[error("merge ref error: {0}")]
    RefError(#[from] RefError),

    /// Underlying commit graph error.
    #[error("merge graph error: {0}")]
    GraphError(#[from] GraphError),

    /// Underlying dependency resolver error.
    #[error("merge dependency error: {0}")]
    DependencyError(#[from] DependencyError),

    /// Database error when persisting merge state.
    #[error("merge database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl MergeError {
    /// `true` for compare-and-swap failures on the target ref.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentRefUpdate { .. } => true,
            Self::RefError(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for MergeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A JSON column could not be encoded or decoded.
    #[error("database JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = RefError::AlreadyExists("main".into());
        assert_eq!(err.to_string(), "ref 'main' already exists");

        let err = MergeError::ConflictUnresolved {
            merge_id: "m1".into(),
            open: 2,
        };
        assert_eq!(err.to_string(), "merge m1 has 2 unresolved conflict(s)");

        let err = DependencyError::CyclicDependencyExceededDepth {
            key: "public.t1".into(),
            max_depth: 10,
        };
        assert!(err.to_string().contains("max depth 10"));

        let err = ConfigError::InvalidValue {
            field: "dependencies.max_depth".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("dependencies.max_depth"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let store_err = StoreError::NotFound("abc".into());
        let core_err: CoreError = store_err.into();
        assert!(matches!(core_err, CoreError::Store(_)));

        let db_err = DatabaseError::NotFound {
            entity: "merge".into(),
            id: "abc".into(),
        };
        let core_err: CoreError = CoreError::Database(db_err);
        assert!(matches!(core_err, CoreError::Database(_)));
    }

    #[test]
    fn test_retryable_classification() {
        let cas = RefError::ConcurrentRefUpdate {
            name: "main".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(cas.is_retryable());
        let core: CoreError = MergeError::RefError(cas).into();
        assert!(core.is_retryable());

        let permanent: CoreError = RefError::NotFound("main".into()).into();
        assert!(!permanent.is_retryable());

        let unresolved: CoreError = MergeError::ConflictUnresolved {
            merge_id: "m".into(),
            open: 1,
        }
        .into();
        assert!(!unresolved.is_retryable());
    }
}
