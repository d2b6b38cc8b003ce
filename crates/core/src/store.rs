//! Content-addressed object store.
//!
//! Blobs, trees and commits are stored once under the hash of their canonical
//! payload. Writes are idempotent and there is no update or delete primitive:
//! a changed object is a new object.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::debug;

use crate::db::queries;
use crate::errors::StoreError;
use crate::models::{
    Commit, Object, ObjectId, ObjectKey, ObjectKind, Snapshot, SnapshotNode, Tree, TreeEntry,
};

/// Stateless object store operations.
///
/// Every method takes a `&Connection` so that writes can be grouped into a
/// caller's transaction.
pub struct ObjectStore;

impl ObjectStore {
    /// Store `payload` as an object of `kind` and return its id.
    ///
    /// Storing the same content twice returns the same id and writes nothing
    /// the second time. Tree and commit payloads must be canonical encodings
    /// whose children, tree and parents are already stored; they are indexed
    /// like [`put_tree`](Self::put_tree) and [`put_commit`](Self::put_commit).
    pub fn put(conn: &Connection, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, StoreError> {
        match kind {
            ObjectKind::Blob => Self::insert(conn, kind, payload),
            ObjectKind::Tree => {
                let tree = Tree::decode(payload).map_err(|e| corrupt(kind, payload, e))?;
                ensure_canonical(kind, payload, &tree.encode()?)?;
                Self::put_tree(conn, &tree)
            }
            ObjectKind::Commit => {
                let commit = Commit::decode(payload).map_err(|e| corrupt(kind, payload, e))?;
                ensure_canonical(kind, payload, &commit.encode()?)?;
                Self::ensure_kind(conn, &commit.tree, ObjectKind::Tree)?;
                for parent in &commit.parents {
                    Self::ensure_kind(conn, parent, ObjectKind::Commit)?;
                }
                Self::put_commit(conn, &commit)
            }
        }
    }

    /// Store a blob.
    pub fn put_blob(conn: &Connection, payload: &[u8]) -> Result<ObjectId, StoreError> {
        Self::insert(conn, ObjectKind::Blob, payload)
    }

    fn insert(conn: &Connection, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, StoreError> {
        let id = ObjectId::for_content(kind, payload);
        queries::insert_object(conn, id.as_str(), kind.as_str(), payload)?;
        Ok(id)
    }

    /// Fail unless `id` is stored with kind `expected`.
    fn ensure_kind(conn: &Connection, id: &ObjectId, expected: ObjectKind) -> Result<(), StoreError> {
        let actual = Self::kind_of(conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if actual != expected {
            return Err(StoreError::KindMismatch {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Store a tree after checking that every child exists with the declared
    /// kind, and index its entries.
    pub fn put_tree(conn: &Connection, tree: &Tree) -> Result<ObjectId, StoreError> {
        for entry in tree.entries() {
            Self::ensure_kind(conn, &entry.id, entry.kind)?;
        }

        let payload = tree.encode()?;
        let id = Self::insert(conn, ObjectKind::Tree, &payload)?;
        for entry in tree.entries() {
            queries::insert_tree_entry(
                conn,
                id.as_str(),
                &entry.name,
                entry.id.as_str(),
                entry.kind.as_str(),
            )?;
        }
        debug!(tree = %id.short(), entries = tree.len(), "stored tree");
        Ok(id)
    }

    /// Store a commit and index its parents. Callers validate the tree and
    /// parents first (see `CommitGraph::create_commit`).
    pub fn put_commit(conn: &Connection, commit: &Commit) -> Result<ObjectId, StoreError> {
        let payload = commit.encode()?;
        let id = Self::insert(conn, ObjectKind::Commit, &payload)?;
        for (ordinal, parent) in commit.parents.iter().enumerate() {
            queries::insert_commit_parent(conn, id.as_str(), parent.as_str(), ordinal)?;
        }
        Ok(id)
    }

    /// Fetch an object by id.
    pub fn get(conn: &Connection, id: &ObjectId) -> Result<Object, StoreError> {
        let row = queries::get_object(conn, id.as_str())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let kind = ObjectKind::parse(&row.kind).ok_or_else(|| StoreError::Corrupt {
            id: row.id.clone(),
            detail: format!("unknown object kind '{}'", row.kind),
        })?;
        Ok(Object {
            id: id.clone(),
            kind,
            payload: row.payload,
        })
    }

    /// Kind of a stored object, or `None` if it is not stored.
    pub fn kind_of(conn: &Connection, id: &ObjectId) -> Result<Option<ObjectKind>, StoreError> {
        match queries::get_object_kind(conn, id.as_str())? {
            None => Ok(None),
            Some(kind) => ObjectKind::parse(&kind)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt {
                    id: id.to_string(),
                    detail: format!("unknown object kind '{kind}'"),
                }),
        }
    }

    pub fn contains(conn: &Connection, id: &ObjectId) -> Result<bool, StoreError> {
        Ok(queries::get_object_kind(conn, id.as_str())?.is_some())
    }

    /// Fetch an object and check it is of `expected` kind.
    pub fn get_typed(
        conn: &Connection,
        id: &ObjectId,
        expected: ObjectKind,
    ) -> Result<Object, StoreError> {
        let object = Self::get(conn, id)?;
        if object.kind != expected {
            return Err(StoreError::KindMismatch {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: object.kind.to_string(),
            });
        }
        Ok(object)
    }

    pub fn get_tree(conn: &Connection, id: &ObjectId) -> Result<Tree, StoreError> {
        let object = Self::get_typed(conn, id, ObjectKind::Tree)?;
        Tree::decode(&object.payload)
    }

    pub fn get_commit(conn: &Connection, id: &ObjectId) -> Result<Commit, StoreError> {
        let object = Self::get_typed(conn, id, ObjectKind::Commit)?;
        Commit::decode(&object.payload)
    }

    /// Resolve `key` below `root_tree`. Returns `None` when any segment is
    /// missing or a non-tree sits on the path.
    pub fn lookup(
        conn: &Connection,
        root_tree: &ObjectId,
        key: &ObjectKey,
    ) -> Result<Option<TreeEntry>, StoreError> {
        let mut current = root_tree.clone();
        let segments = key.segments();
        for (i, name) in segments.iter().enumerate() {
            let tree = Self::get_tree(conn, &current)?;
            let Some(entry) = tree.get(name) else {
                return Ok(None);
            };
            if i + 1 == segments.len() {
                return Ok(Some(entry.clone()));
            }
            if entry.kind != ObjectKind::Tree {
                return Ok(None);
            }
            current = entry.id.clone();
        }
        Ok(None)
    }

    /// Write a captured snapshot as blobs and trees, returning the root tree
    /// id. Leaves become blobs holding the definition text.
    pub fn write_snapshot(conn: &Connection, snapshot: &Snapshot) -> Result<ObjectId, StoreError> {
        let id = Self::write_group(conn, &snapshot.objects)?;
        debug!(root = %id.short(), "wrote snapshot");
        Ok(id)
    }

    fn write_group(
        conn: &Connection,
        children: &BTreeMap<String, SnapshotNode>,
    ) -> Result<ObjectId, StoreError> {
        let mut tree = Tree::new();
        for (name, node) in children {
            let entry = match node {
                SnapshotNode::Leaf(definition) => {
                    let id = Self::put_blob(conn, definition.as_bytes())?;
                    TreeEntry::new(name.clone(), id, ObjectKind::Blob)
                }
                SnapshotNode::Group(grandchildren) => {
                    let id = Self::write_group(conn, grandchildren)?;
                    TreeEntry::new(name.clone(), id, ObjectKind::Tree)
                }
            };
            tree.insert(entry)?;
        }
        Self::put_tree(conn, &tree)
    }
}

fn corrupt(kind: ObjectKind, payload: &[u8], e: StoreError) -> StoreError {
    StoreError::Corrupt {
        id: ObjectId::for_content(kind, payload).to_string(),
        detail: format!("undecodable {kind} payload: {e}"),
    }
}

/// Ids hash the canonical encoding, so any other spelling is refused.
fn ensure_canonical(kind: ObjectKind, payload: &[u8], canonical: &[u8]) -> Result<(), StoreError> {
    if payload != canonical {
        return Err(StoreError::Corrupt {
            id: ObjectId::for_content(kind, payload).to_string(),
            detail: format!("non-canonical {kind} payload"),
        });
    }
    Ok(())
}
