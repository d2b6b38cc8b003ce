//! Named, mutable pointers to commits.
//!
//! Branches move only through compare-and-swap: an update names the target it
//! expects to replace, and loses with [`RefError::ConcurrentRefUpdate`] if any
//! other writer got there first. Tags never move once created.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::queries::{self, RefRow};
use crate::errors::{RefError, StoreError};
use crate::models::{ObjectId, ObjectKind, Ref, RefKind};
use crate::ref_policy::{RefPolicy, RefPolicyDecision};
use crate::store::ObjectStore;

/// Ref operations under a [`RefPolicy`].
#[derive(Debug, Clone)]
pub struct RefManager {
    policy: RefPolicy,
}

impl RefManager {
    pub fn new(policy: RefPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RefPolicy {
        &self.policy
    }

    /// Create a ref pointing at an existing commit.
    pub fn create(
        &self,
        conn: &Connection,
        name: &str,
        kind: RefKind,
        target: &ObjectId,
    ) -> Result<Ref, RefError> {
        self.policy.validate_name(name)?;
        ensure_commit(conn, target)?;

        if !queries::insert_ref(conn, name, kind.as_str(), target.as_str())? {
            return Err(RefError::AlreadyExists(name.to_string()));
        }
        info!(name, kind = kind.as_str(), target = %target.short(), "created ref");
        self.get(conn, name)
    }

    /// Move a branch from `expected` to `new`.
    ///
    /// Fails with [`RefError::ConcurrentRefUpdate`] and changes nothing when
    /// the branch no longer points at `expected`.
    pub fn update(
        &self,
        conn: &Connection,
        name: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<Ref, RefError> {
        let current = self.get(conn, name)?;
        if current.kind == RefKind::Tag {
            return Err(RefError::TagImmutable(name.to_string()));
        }
        ensure_commit(conn, new)?;

        let changed = queries::compare_and_swap_ref(conn, name, expected.as_str(), new.as_str())?;
        if changed == 0 {
            let actual = match queries::get_ref(conn, name)? {
                Some(row) => row.target,
                None => return Err(RefError::NotFound(name.to_string())),
            };
            warn!(name, expected = %expected.short(), actual = %actual, "ref compare-and-swap lost");
            return Err(RefError::ConcurrentRefUpdate {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        debug!(name, from = %expected.short(), to = %new.short(), "advanced ref");
        self.get(conn, name)
    }

    /// Delete a ref unless it is protected.
    pub fn delete(&self, conn: &Connection, name: &str) -> Result<(), RefError> {
        if let RefPolicyDecision::Protected { pattern } = self.policy.evaluate_delete(name) {
            return Err(RefError::Protected {
                name: name.to_string(),
                pattern,
            });
        }
        if queries::delete_ref(conn, name)? == 0 {
            return Err(RefError::NotFound(name.to_string()));
        }
        info!(name, "deleted ref");
        Ok(())
    }

    pub fn get(&self, conn: &Connection, name: &str) -> Result<Ref, RefError> {
        self.find(conn, name)?
            .ok_or_else(|| RefError::NotFound(name.to_string()))
    }

    /// Like [`get`](Self::get) but `None` for a missing ref.
    pub fn find(&self, conn: &Connection, name: &str) -> Result<Option<Ref>, RefError> {
        queries::get_ref(conn, name)?.map(ref_from_row).transpose()
    }

    /// Current target commit of a ref.
    pub fn resolve(&self, conn: &Connection, name: &str) -> Result<ObjectId, RefError> {
        Ok(self.get(conn, name)?.target)
    }

    /// All refs ordered by name, optionally only one kind.
    pub fn list(&self, conn: &Connection, kind: Option<RefKind>) -> Result<Vec<Ref>, RefError> {
        queries::list_refs(conn, kind.map(|k| k.as_str()))?
            .into_iter()
            .map(ref_from_row)
            .collect()
    }
}

fn ensure_commit(conn: &Connection, id: &ObjectId) -> Result<(), RefError> {
    match ObjectStore::kind_of(conn, id)? {
        Some(ObjectKind::Commit) => Ok(()),
        Some(other) => Err(StoreError::KindMismatch {
            id: id.to_string(),
            expected: ObjectKind::Commit.to_string(),
            actual: other.to_string(),
        }
        .into()),
        None => Err(StoreError::NotFound(id.to_string()).into()),
    }
}

fn ref_from_row(row: RefRow) -> Result<Ref, RefError> {
    let kind = RefKind::parse(&row.kind).ok_or_else(|| StoreError::Corrupt {
        id: row.name.clone(),
        detail: format!("unknown ref kind '{}'", row.kind),
    })?;
    Ok(Ref {
        target: ObjectId::from_hex(&row.target)?,
        updated_at: queries::parse_datetime(&row.updated_at),
        name: row.name,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefsConfig;
    use crate::db::Database;
    use crate::models::{Commit, CommitMeta, Snapshot};

    fn setup() -> (Database, RefManager) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let policy = RefPolicy::from_config(&RefsConfig::default()).unwrap();
        (db, RefManager::new(policy))
    }

    fn commit(conn: &Connection, def: &str, parents: Vec<ObjectId>) -> ObjectId {
        let tree = ObjectStore::write_snapshot(conn, &Snapshot::new().with("t1", def)).unwrap();
        ObjectStore::put_commit(conn, &Commit::new(tree, parents, CommitMeta::now("t", def)))
            .unwrap()
    }

    #[test]
    fn test_create_and_resolve() {
        let (db, refs) = setup();
        let conn = db.conn();
        let c1 = commit(&conn, "a", vec![]);
        let r = refs.create(&conn, "main", RefKind::Branch, &c1).unwrap();
        assert_eq!(r.target, c1);
        assert_eq!(refs.resolve(&conn, "main").unwrap(), c1);
        assert!(matches!(
            refs.create(&conn, "main", RefKind::Branch, &c1),
            Err(RefError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_requires_commit_target() {
        let (db, refs) = setup();
        let conn = db.conn();
        let ghost = ObjectId::for_content(ObjectKind::Commit, b"ghost");
        assert!(matches!(
            refs.create(&conn, "main", RefKind::Branch, &ghost),
            Err(RefError::StoreError(StoreError::NotFound(_)))
        ));
        let blob = ObjectStore::put_blob(&conn, b"x").unwrap();
        assert!(matches!(
            refs.create(&conn, "main", RefKind::Branch, &blob),
            Err(RefError::StoreError(StoreError::KindMismatch { .. }))
        ));
    }

    #[test]
    fn test_update_compare_and_swap() {
        let (db, refs) = setup();
        let conn = db.conn();
        let c1 = commit(&conn, "a", vec![]);
        let c2 = commit(&conn, "b", vec![c1.clone()]);
        let c3 = commit(&conn, "c", vec![c1.clone()]);
        refs.create(&conn, "dev", RefKind::Branch, &c1).unwrap();

        refs.update(&conn, "dev", &c1, &c2).unwrap();
        let err = refs.update(&conn, "dev", &c1, &c3).unwrap_err();
        match err {
            RefError::ConcurrentRefUpdate { expected, actual, .. } => {
                assert_eq!(expected, c1.to_string());
                assert_eq!(actual, c2.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(refs.resolve(&conn, "dev").unwrap(), c2);
    }

    #[test]
    fn test_tags_are_immutable() {
        let (db, refs) = setup();
        let conn = db.conn();
        let c1 = commit(&conn, "a", vec![]);
        let c2 = commit(&conn, "b", vec![c1.clone()]);
        refs.create(&conn, "v1", RefKind::Tag, &c1).unwrap();
        assert!(matches!(
            refs.update(&conn, "v1", &c1, &c2),
            Err(RefError::TagImmutable(_))
        ));
        assert_eq!(refs.list(&conn, Some(RefKind::Tag)).unwrap().len(), 1);
        assert!(refs.list(&conn, Some(RefKind::Branch)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_protected_and_missing() {
        let (db, refs) = setup();
        let conn = db.conn();
        let c1 = commit(&conn, "a", vec![]);
        refs.create(&conn, "main", RefKind::Branch, &c1).unwrap();
        refs.create(&conn, "topic", RefKind::Branch, &c1).unwrap();

        assert!(matches!(
            refs.delete(&conn, "main"),
            Err(RefError::Protected { .. })
        ));
        refs.delete(&conn, "topic").unwrap();
        assert!(matches!(
            refs.delete(&conn, "topic"),
            Err(RefError::NotFound(_))
        ));
        assert!(refs.find(&conn, "topic").unwrap().is_none());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (db, refs) = setup();
        let conn = db.conn();
        let c1 = commit(&conn, "a", vec![]);
        assert!(matches!(
            refs.create(&conn, "bad..name", RefKind::Branch, &c1),
            Err(RefError::InvalidName { .. })
        ));
    }
}
