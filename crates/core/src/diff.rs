//! Structural diff between two trees.
//!
//! Subtrees with equal ids are skipped without being loaded. When both sides
//! hold a tree under the same name the walk descends, so changes are reported
//! at the finest key that differs.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dependency::ClosureEntry;
use crate::errors::StoreError;
use crate::models::{ObjectId, ObjectKey, ObjectKind, TreeEntry};
use crate::store::ObjectStore;

/// Kind of change to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// A single difference between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: ObjectKey,
    pub kind: ChangeKind,
    /// Entry on the old side, absent for additions.
    pub old: Option<TreeEntry>,
    /// Entry on the new side, absent for removals.
    pub new: Option<TreeEntry>,
    /// Objects impacted by this change. Empty unless filled by the merge
    /// engine.
    pub dependents: Vec<ClosureEntry>,
}

impl Change {
    fn new(key: ObjectKey, old: Option<TreeEntry>, new: Option<TreeEntry>) -> Self {
        let kind = match (&old, &new) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        };
        Self {
            key,
            kind,
            old,
            new,
            dependents: Vec::new(),
        }
    }
}

/// Stateless tree differ.
pub struct DiffEngine;

impl DiffEngine {
    /// Changes turning tree `a` into tree `b`, sorted by key.
    pub fn diff(conn: &Connection, a: &ObjectId, b: &ObjectId) -> Result<Vec<Change>, StoreError> {
        let mut changes = Vec::new();
        let mut stack: Vec<(Option<ObjectKey>, ObjectId, ObjectId)> =
            vec![(None, a.clone(), b.clone())];

        while let Some((prefix, left_id, right_id)) = stack.pop() {
            if left_id == right_id {
                continue;
            }
            let left = ObjectStore::get_tree(conn, &left_id)?;
            let right = ObjectStore::get_tree(conn, &right_id)?;

            let names: BTreeSet<&str> = left
                .entries()
                .chain(right.entries())
                .map(|e| e.name.as_str())
                .collect();

            for name in names {
                let key = match &prefix {
                    Some(p) => p.child(name),
                    None => ObjectKey::from_segments([name]),
                };
                match (left.get(name), right.get(name)) {
                    (Some(l), Some(r)) if l.same_target(r) => {}
                    (Some(l), Some(r))
                        if l.kind == ObjectKind::Tree && r.kind == ObjectKind::Tree =>
                    {
                        stack.push((Some(key), l.id.clone(), r.id.clone()));
                    }
                    (l, r) => changes.push(Change::new(key, l.cloned(), r.cloned())),
                }
            }
        }

        changes.sort_by(|x, y| x.key.cmp(&y.key));
        debug!(a = %a.short(), b = %b.short(), changes = changes.len(), "diffed trees");
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Snapshot;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn summary(changes: &[Change]) -> Vec<(String, ChangeKind)> {
        changes.iter().map(|c| (c.key.to_string(), c.kind)).collect()
    }

    #[test]
    fn test_identical_trees_have_no_changes() {
        let db = setup_db();
        let conn = db.conn();
        let t = ObjectStore::write_snapshot(&conn, &Snapshot::new().with("t1.a", "int")).unwrap();
        assert!(DiffEngine::diff(&conn, &t, &t).unwrap().is_empty());
    }

    #[test]
    fn test_finest_granularity() {
        let db = setup_db();
        let conn = db.conn();
        let base = Snapshot::new()
            .with("public.t1.a", "int")
            .with("public.t1.b", "text")
            .with("public.v1", "select 1");
        let next = Snapshot::new()
            .with("public.t1.a", "bigint")
            .with("public.t1.c", "date")
            .with("public.v2", "select 2");
        let a = ObjectStore::write_snapshot(&conn, &base).unwrap();
        let b = ObjectStore::write_snapshot(&conn, &next).unwrap();

        let changes = DiffEngine::diff(&conn, &a, &b).unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                ("public.t1.a".into(), ChangeKind::Modified),
                ("public.t1.b".into(), ChangeKind::Removed),
                ("public.t1.c".into(), ChangeKind::Added),
                ("public.v1".into(), ChangeKind::Removed),
                ("public.v2".into(), ChangeKind::Added),
            ]
        );
        assert!(changes[1].new.is_none());
        assert!(changes[2].old.is_none());
        assert!(changes.iter().all(|c| c.dependents.is_empty()));
    }

    #[test]
    fn test_whole_subtree_added_or_removed() {
        let db = setup_db();
        let conn = db.conn();
        let a = ObjectStore::write_snapshot(&conn, &Snapshot::new().with("t1.a", "int")).unwrap();
        let b = ObjectStore::write_snapshot(
            &conn,
            &Snapshot::new().with("t1.a", "int").with("t2.x", "int").with("t2.y", "int"),
        )
        .unwrap();

        let added = DiffEngine::diff(&conn, &a, &b).unwrap();
        assert_eq!(summary(&added), vec![("t2".into(), ChangeKind::Added)]);
        assert_eq!(added[0].new.as_ref().unwrap().kind, ObjectKind::Tree);

        let removed = DiffEngine::diff(&conn, &b, &a).unwrap();
        assert_eq!(summary(&removed), vec![("t2".into(), ChangeKind::Removed)]);
    }

    #[test]
    fn test_leaf_replaced_by_group_is_modified() {
        let db = setup_db();
        let conn = db.conn();
        let a = ObjectStore::write_snapshot(&conn, &Snapshot::new().with("f1", "body")).unwrap();
        let b =
            ObjectStore::write_snapshot(&conn, &Snapshot::new().with("f1.arg", "int")).unwrap();
        let changes = DiffEngine::diff(&conn, &a, &b).unwrap();
        assert_eq!(summary(&changes), vec![("f1".into(), ChangeKind::Modified)]);
    }
}
