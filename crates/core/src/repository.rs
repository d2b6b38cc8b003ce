//! The repository: one database plus the components that operate on it.
//!
//! [`Repository`] is the call surface for embedding services. Every method
//! takes the connection lock for its own duration only, and every mutating
//! method runs in a single transaction, so a `Repository` can be shared across
//! threads in an `Arc`.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::VcsConfig;
use crate::conflict::ConflictResolver;
use crate::db::queries::{self, AuditLogRow};
use crate::db::Database;
use crate::dependency::{Closure, DependencyEdge, DependencyResolver, Relation};
use crate::diff::{Change, DiffEngine};
use crate::errors::{CoreError, DatabaseError, StoreError};
use crate::graph::{CommitGraph, HistoryEntry};
use crate::merge_engine::{MergeEngine, MergeOutcome, MergePlan};
use crate::models::{
    Annotation, AnnotationSubject, AuditEntry, Commit, CommitMeta, Conflict, MergeOperation,
    MergeStatus, Object, ObjectId, ObjectKey, ObjectKind, Ref, RefKind, Resolution, Snapshot,
    Tree, TreeEntry,
};
use crate::ref_policy::RefPolicy;
use crate::refs::RefManager;
use crate::store::ObjectStore;

/// A schema version-control repository.
pub struct Repository {
    db: Database,
    config: VcsConfig,
    refs: RefManager,
    deps: DependencyResolver,
    merges: MergeEngine,
}

impl Repository {
    /// Open (or create) the repository database named by the config.
    pub fn open(config: VcsConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let db = Database::new(&config.store.database_path)?;
        Self::with_database(db, config)
    }

    /// A repository backed by an in-memory database.
    pub fn in_memory(config: VcsConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Self::with_database(Database::in_memory()?, config)
    }

    fn with_database(db: Database, config: VcsConfig) -> Result<Self, CoreError> {
        db.initialize()?;
        let refs = RefManager::new(RefPolicy::from_config(&config.refs)?);
        let deps = DependencyResolver::new(config.dependencies.max_depth);
        let merges = MergeEngine::new(config.merge.clone(), refs.clone(), deps.clone());
        info!(
            default_branch = %config.refs.default_branch,
            max_depth = config.dependencies.max_depth,
            "repository ready"
        );
        Ok(Self {
            db,
            config,
            refs,
            deps,
            merges,
        })
    }

    pub fn config(&self) -> &VcsConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Store an object; storing the same content twice returns the same id.
    /// Trees and commits are checked and indexed in one transaction.
    pub fn put(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, CoreError> {
        self.db
            .transaction(|conn| Ok(ObjectStore::put(conn, kind, payload)?))
    }

    pub fn get(&self, id: &ObjectId) -> Result<Object, CoreError> {
        Ok(ObjectStore::get(&self.db.conn(), id)?)
    }

    pub fn put_tree(&self, tree: &Tree) -> Result<ObjectId, CoreError> {
        Ok(ObjectStore::put_tree(&self.db.conn(), tree)?)
    }

    pub fn get_tree(&self, id: &ObjectId) -> Result<Tree, CoreError> {
        Ok(ObjectStore::get_tree(&self.db.conn(), id)?)
    }

    pub fn get_commit(&self, id: &ObjectId) -> Result<Commit, CoreError> {
        Ok(ObjectStore::get_commit(&self.db.conn(), id)?)
    }

    /// Write every blob and tree of a snapshot; returns the root tree id.
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<ObjectId, CoreError> {
        self.db
            .transaction(|conn| Ok(ObjectStore::write_snapshot(conn, snapshot)?))
    }

    /// Entry at `key` below a root tree.
    pub fn lookup(&self, root: &ObjectId, key: &ObjectKey) -> Result<Option<TreeEntry>, CoreError> {
        Ok(ObjectStore::lookup(&self.db.conn(), root, key)?)
    }

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    pub fn create_ref(
        &self,
        name: &str,
        kind: RefKind,
        target: &ObjectId,
        actor: &str,
    ) -> Result<Ref, CoreError> {
        self.db.transaction(|conn| {
            let created = self.refs.create(conn, name, kind, target)?;
            audit(conn, "ref_created", name, actor, &format!("{kind} at {target}"))?;
            Ok(created)
        })
    }

    /// Compare-and-swap a branch from `expected` to `new`.
    pub fn update_ref(
        &self,
        name: &str,
        expected: &ObjectId,
        new: &ObjectId,
        actor: &str,
    ) -> Result<Ref, CoreError> {
        self.db.transaction(|conn| {
            let updated = self.refs.update(conn, name, expected, new)?;
            audit(conn, "ref_updated", name, actor, &format!("{expected} -> {new}"))?;
            Ok(updated)
        })
    }

    pub fn delete_ref(&self, name: &str, actor: &str) -> Result<(), CoreError> {
        self.db.transaction(|conn| {
            let target = self.refs.resolve(conn, name)?;
            self.refs.delete(conn, name)?;
            audit(conn, "ref_deleted", name, actor, &format!("was {target}"))?;
            Ok(())
        })
    }

    pub fn get_ref(&self, name: &str) -> Result<Ref, CoreError> {
        Ok(self.refs.get(&self.db.conn(), name)?)
    }

    pub fn resolve(&self, name: &str) -> Result<ObjectId, CoreError> {
        Ok(self.refs.resolve(&self.db.conn(), name)?)
    }

    pub fn list_refs(&self, kind: Option<RefKind>) -> Result<Vec<Ref>, CoreError> {
        Ok(self.refs.list(&self.db.conn(), kind)?)
    }

    // -----------------------------------------------------------------------
    // Commits & history
    // -----------------------------------------------------------------------

    pub fn create_commit(
        &self,
        tree: &ObjectId,
        parents: &[ObjectId],
        meta: CommitMeta,
    ) -> Result<ObjectId, CoreError> {
        self.db
            .transaction(|conn| Ok(CommitGraph::create_commit(conn, tree, parents, meta)?))
    }

    /// Record a captured snapshot as the next commit on `branch`.
    ///
    /// A missing branch is created pointing at a new root commit. An existing
    /// branch advances by compare-and-swap from the head read in the same
    /// transaction.
    pub fn commit_snapshot(
        &self,
        branch: &str,
        author: &str,
        message: &str,
        snapshot: &Snapshot,
    ) -> Result<ObjectId, CoreError> {
        self.db.transaction(|conn| {
            let tree = ObjectStore::write_snapshot(conn, snapshot)?;
            let head = self.refs.find(conn, branch)?.map(|r| r.target);
            let parents: Vec<ObjectId> = head.iter().cloned().collect();
            let commit =
                CommitGraph::create_commit(conn, &tree, &parents, CommitMeta::now(author, message))?;

            match &head {
                Some(head) => {
                    self.refs.update(conn, branch, head, &commit)?;
                }
                None => {
                    self.refs.create(conn, branch, RefKind::Branch, &commit)?;
                }
            }
            debug!(branch, commit = %commit.short(), root = head.is_none(), "committed snapshot");
            audit(conn, "commit", branch, author, &format!("{commit}: {message}"))?;
            Ok(commit)
        })
    }

    pub fn parents(&self, commit: &ObjectId) -> Result<Vec<ObjectId>, CoreError> {
        Ok(CommitGraph::parents(&self.db.conn(), commit)?)
    }

    pub fn merge_base(&self, a: &ObjectId, b: &ObjectId) -> Result<ObjectId, CoreError> {
        Ok(CommitGraph::merge_base(&self.db.conn(), a, b)?)
    }

    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool, CoreError> {
        Ok(CommitGraph::is_ancestor(&self.db.conn(), ancestor, descendant)?)
    }

    /// Newest-first history of a ref or commit.
    pub fn history(&self, start: &ObjectId, limit: usize) -> Result<Vec<HistoryEntry>, CoreError> {
        Ok(CommitGraph::history(&self.db.conn(), start, limit)?)
    }

    /// Changes turning tree `a` into tree `b`.
    pub fn diff(&self, a: &ObjectId, b: &ObjectId) -> Result<Vec<Change>, CoreError> {
        Ok(DiffEngine::diff(&self.db.conn(), a, b)?)
    }

    /// Changes between the trees of two commits.
    pub fn diff_commits(&self, a: &ObjectId, b: &ObjectId) -> Result<Vec<Change>, CoreError> {
        let conn = self.db.conn();
        let tree_a = ObjectStore::get_commit(&conn, a)?.tree;
        let tree_b = ObjectStore::get_commit(&conn, b)?.tree;
        Ok(DiffEngine::diff(&conn, &tree_a, &tree_b)?)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    pub fn add_edge(
        &self,
        from: &ObjectKey,
        to: &ObjectKey,
        relation: Relation,
    ) -> Result<bool, CoreError> {
        Ok(self.deps.add_edge(&self.db.conn(), from, to, relation)?)
    }

    pub fn remove_edge(
        &self,
        from: &ObjectKey,
        to: &ObjectKey,
        relation: Relation,
    ) -> Result<bool, CoreError> {
        Ok(self.deps.remove_edge(&self.db.conn(), from, to, relation)?)
    }

    pub fn edges_for(&self, key: &ObjectKey) -> Result<Vec<DependencyEdge>, CoreError> {
        Ok(self.deps.edges_for(&self.db.conn(), key)?)
    }

    pub fn dependents_of(&self, key: &ObjectKey) -> Result<Vec<DependencyEdge>, CoreError> {
        Ok(self.deps.dependents_of(&self.db.conn(), key)?)
    }

    /// Closure of `key` under the configured depth bound.
    pub fn closure(&self, key: &ObjectKey) -> Result<Closure, CoreError> {
        Ok(self.deps.closure(&self.db.conn(), key)?)
    }

    pub fn transitive_closure(&self, key: &ObjectKey, max_depth: usize) -> Result<Closure, CoreError> {
        Ok(self.deps.transitive_closure(&self.db.conn(), key, max_depth)?)
    }

    pub fn impact_of(&self, key: &ObjectKey) -> Result<Closure, CoreError> {
        Ok(self
            .deps
            .impact_of(&self.db.conn(), key, self.deps.max_depth())?)
    }

    // -----------------------------------------------------------------------
    // Merges
    // -----------------------------------------------------------------------

    /// Merge plan for two refs, without writing anything.
    pub fn preview_merge(&self, source_ref: &str, target_ref: &str) -> Result<MergePlan, CoreError> {
        let conn = self.db.conn();
        let source = self.refs.resolve(&conn, source_ref)?;
        let target = self.refs.resolve(&conn, target_ref)?;
        Ok(self.merges.plan(&conn, &source, &target)?)
    }

    pub fn request_merge(
        &self,
        source_ref: &str,
        target_ref: &str,
        requested_by: &str,
    ) -> Result<MergeOutcome, CoreError> {
        Ok(self
            .merges
            .request_merge(&self.db, source_ref, target_ref, requested_by)?)
    }

    pub fn resolve_one(
        &self,
        merge_id: &str,
        key: &ObjectKey,
        resolution: Resolution,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Conflict, CoreError> {
        Ok(ConflictResolver::resolve_one(
            &self.db,
            merge_id,
            key,
            resolution,
            resolved_by,
            note,
        )?)
    }

    pub fn resolve_batch(
        &self,
        merge_id: &str,
        keys: &[ObjectKey],
        resolution: Resolution,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Vec<Conflict>, CoreError> {
        Ok(ConflictResolver::resolve_batch(
            &self.db,
            merge_id,
            keys,
            resolution,
            resolved_by,
            note,
        )?)
    }

    pub fn reject(
        &self,
        merge_id: &str,
        key: &ObjectKey,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Conflict, CoreError> {
        Ok(ConflictResolver::reject(&self.db, merge_id, key, resolved_by, note)?)
    }

    /// Finish a merge once no conflict is open. Without a committer the
    /// configured default is recorded.
    pub fn finalize(&self, merge_id: &str, committer: Option<&str>) -> Result<MergeOutcome, CoreError> {
        Ok(self.merges.finalize(&self.db, merge_id, committer)?)
    }

    pub fn abort(&self, merge_id: &str, actor: &str) -> Result<MergeOperation, CoreError> {
        Ok(self.merges.abort(&self.db, merge_id, actor)?)
    }

    pub fn merge_operation(&self, merge_id: &str) -> Result<MergeOperation, CoreError> {
        Ok(MergeEngine::merge_operation(&self.db.conn(), merge_id)?)
    }

    pub fn list_merge_operations(
        &self,
        status: Option<MergeStatus>,
        limit: u32,
    ) -> Result<Vec<MergeOperation>, CoreError> {
        Ok(MergeEngine::list_merge_operations(&self.db.conn(), status, limit)?)
    }

    pub fn conflicts(&self, merge_id: &str) -> Result<Vec<Conflict>, CoreError> {
        Ok(ConflictResolver::conflicts(&self.db.conn(), merge_id)?)
    }

    pub fn conflict(&self, merge_id: &str, key: &ObjectKey) -> Result<Conflict, CoreError> {
        Ok(ConflictResolver::conflict(&self.db.conn(), merge_id, key)?)
    }

    // -----------------------------------------------------------------------
    // Annotations & audit
    // -----------------------------------------------------------------------

    /// Attach opaque metadata to a commit or conflict.
    pub fn annotate(
        &self,
        subject: &AnnotationSubject,
        key: &str,
        value: serde_json::Value,
    ) -> Result<Annotation, CoreError> {
        let encoded = serde_json::to_string(&value).map_err(DatabaseError::from)?;
        self.db.transaction(|conn| {
            ensure_subject(conn, subject)?;
            let id = queries::insert_annotation(
                conn,
                subject.kind_str(),
                subject.id_str(),
                key,
                &encoded,
            )?;
            debug!(id, kind = subject.kind_str(), subject = subject.id_str(), key, "annotated");
            Ok(Annotation {
                id,
                subject: subject.clone(),
                key: key.to_string(),
                value,
                created_at: chrono::Utc::now(),
            })
        })
    }

    /// Annotations of a subject in insertion order.
    pub fn annotations(&self, subject: &AnnotationSubject) -> Result<Vec<Annotation>, CoreError> {
        let rows =
            queries::list_annotations(&self.db.conn(), subject.kind_str(), subject.id_str())?;
        rows.into_iter()
            .map(|row| {
                let value = serde_json::from_str(&row.value).map_err(DatabaseError::from)?;
                Ok(Annotation {
                    id: row.id,
                    subject: subject.clone(),
                    key: row.key,
                    value,
                    created_at: queries::parse_datetime(&row.created_at),
                })
            })
            .collect()
    }

    /// Most recent audit entries, newest first.
    pub fn audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(self
            .db
            .list_audit_log(limit)?
            .into_iter()
            .map(audit_entry_from_row)
            .collect())
    }

    /// Audit entries about one ref or merge, oldest first.
    pub fn audit_log_for(&self, subject: &str) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(queries::list_audit_log_for_subject(&self.db.conn(), subject)?
            .into_iter()
            .map(audit_entry_from_row)
            .collect())
    }
}

fn audit(
    conn: &Connection,
    action: &str,
    subject: &str,
    actor: &str,
    details: &str,
) -> Result<(), DatabaseError> {
    queries::insert_audit_log(conn, action, Some(subject), Some(actor), Some(details), true)?;
    Ok(())
}

fn ensure_subject(conn: &Connection, subject: &AnnotationSubject) -> Result<(), CoreError> {
    match subject {
        AnnotationSubject::Commit(id) => match ObjectStore::kind_of(conn, id)? {
            Some(ObjectKind::Commit) => Ok(()),
            Some(other) => Err(StoreError::KindMismatch {
                id: id.to_string(),
                expected: ObjectKind::Commit.to_string(),
                actual: other.to_string(),
            }
            .into()),
            None => Err(StoreError::NotFound(id.to_string()).into()),
        },
        AnnotationSubject::Conflict(id) => match queries::get_conflict(conn, id)? {
            Some(_) => Ok(()),
            None => Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: id.clone(),
            }
            .into()),
        },
    }
}

fn audit_entry_from_row(row: AuditLogRow) -> AuditEntry {
    AuditEntry {
        id: row.id,
        created_at: queries::parse_datetime(&row.created_at),
        action: row.action,
        subject: row.subject,
        actor: row.actor,
        details: row.details,
        success: row.success,
    }
}
