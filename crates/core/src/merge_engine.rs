//! Three-way merge engine.
//!
//! The [`MergeEngine`] drives a merge request through a state machine:
//!
//! 1. Resolve the merge base of the source and target heads.
//! 2. Diff the base tree against both heads.
//! 3. Classify every touched key six ways.
//! 4. With no conflicts, build the merged tree, commit it and advance the
//!    target ref by compare-and-swap, all in one transaction.
//! 5. Otherwise persist the conflicts and wait for [`ConflictResolver`]
//!    decisions before [`finalize`](MergeEngine::finalize).
//!
//! A lost compare-and-swap rolls the whole transaction back and surfaces as
//! the retryable [`MergeError::ConcurrentRefUpdate`].

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MergeConfig;
use crate::conflict::{
    self, Classification, ConflictDetector, ConflictResolver, TreeEditor,
};
use crate::db::queries::{self, MergeOperationRow};
use crate::db::Database;
use crate::dependency::DependencyResolver;
use crate::diff::{Change, DiffEngine};
use crate::errors::{GraphError, MergeError, RefError};
use crate::graph::CommitGraph;
use crate::models::{
    CommitMeta, Conflict, ConflictKind, MergeOperation, MergeStatus, ObjectId, ObjectKey,
};
use crate::refs::RefManager;
use crate::store::ObjectStore;

// ---------------------------------------------------------------------------
// Merge state machine
// ---------------------------------------------------------------------------

/// States of a merge request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Requested,
    BaseResolved,
    Diffed,
    Classified,
    AutoMerged,
    AwaitingResolution,
    Finalized,
    Aborted,
}

impl MergeState {
    /// Legal transitions. Any non-terminal state may abort.
    pub fn can_transition_to(&self, next: MergeState) -> bool {
        use MergeState::*;
        match (self, next) {
            (Finalized | Aborted, _) => false,
            (_, Aborted) => true,
            (Requested, BaseResolved)
            | (BaseResolved, Diffed)
            | (Diffed, Classified)
            | (Classified, AutoMerged)
            | (Classified, AwaitingResolution)
            | (AutoMerged, Finalized)
            | (AwaitingResolution, Finalized) => true,
            _ => false,
        }
    }

    /// Move to `next` or fail with [`MergeError::InvalidStateTransition`].
    pub fn advance(self, next: MergeState) -> Result<MergeState, MergeError> {
        if !self.can_transition_to(next) {
            return Err(MergeError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self, to = %next, "merge state");
        Ok(next)
    }

    /// The status stored for a merge operation in this state.
    pub fn persisted_status(&self) -> MergeStatus {
        match self {
            Self::Requested
            | Self::BaseResolved
            | Self::Diffed
            | Self::Classified
            | Self::AutoMerged => MergeStatus::Pending,
            Self::AwaitingResolution => MergeStatus::Resolving,
            Self::Finalized => MergeStatus::Completed,
            Self::Aborted => MergeStatus::Aborted,
        }
    }

    /// Best state recoverable from a persisted status.
    pub fn from_status(status: MergeStatus) -> Self {
        match status {
            MergeStatus::Pending => Self::Classified,
            MergeStatus::Resolving => Self::AwaitingResolution,
            MergeStatus::Completed => Self::Finalized,
            MergeStatus::Aborted => Self::Aborted,
        }
    }
}

impl std::fmt::Display for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::BaseResolved => write!(f, "base_resolved"),
            Self::Diffed => write!(f, "diffed"),
            Self::Classified => write!(f, "classified"),
            Self::AutoMerged => write!(f, "auto_merged"),
            Self::AwaitingResolution => write!(f, "awaiting_resolution"),
            Self::Finalized => write!(f, "finalized"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan & outcome
// ---------------------------------------------------------------------------

/// Everything computed for a merge before anything is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePlan {
    pub source_head: ObjectId,
    pub target_head: ObjectId,
    pub base: ObjectId,
    pub base_tree: ObjectId,
    pub source_tree: ObjectId,
    pub target_tree: ObjectId,
    /// One entry per touched key, sorted by key.
    pub classifications: Vec<Classification>,
}

impl MergePlan {
    pub fn conflicts(&self) -> impl Iterator<Item = &Classification> {
        self.classifications.iter().filter(|c| c.is_conflict())
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts().next().is_some()
    }

    /// The source head is already part of the target's history.
    pub fn up_to_date(&self) -> bool {
        self.base == self.source_head
    }

    /// The target has not moved since the merge base.
    pub fn can_fast_forward(&self) -> bool {
        self.base == self.target_head
    }
}

/// Result of a merge request or finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merge_id: String,
    pub state: MergeState,
    pub base: ObjectId,
    /// New head of the target ref once finalized.
    pub result_commit: Option<ObjectId>,
    /// Open conflicts awaiting resolution. Empty once finalized.
    pub conflicts: Vec<Conflict>,
    /// What the merge changed on the target, with impacted dependents.
    /// Empty until finalized.
    pub changes: Vec<Change>,
}

impl MergeOutcome {
    pub fn is_finalized(&self) -> bool {
        self.state == MergeState::Finalized
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The three-way merge engine.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: MergeConfig,
    refs: RefManager,
    deps: DependencyResolver,
}

impl MergeEngine {
    pub fn new(config: MergeConfig, refs: RefManager, deps: DependencyResolver) -> Self {
        Self { config, refs, deps }
    }

    /// Compute the merge plan of two commits without writing anything.
    pub fn plan(
        &self,
        conn: &Connection,
        source_head: &ObjectId,
        target_head: &ObjectId,
    ) -> Result<MergePlan, MergeError> {
        let mut state = MergeState::Requested;

        let base = match CommitGraph::merge_base(conn, source_head, target_head) {
            Ok(base) => base,
            Err(GraphError::NoCommonAncestor { .. }) => {
                return Err(MergeError::NoCommonAncestor {
                    source_head: source_head.to_string(),
                    target_head: target_head.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        state = state.advance(MergeState::BaseResolved)?;

        let base_tree = ObjectStore::get_commit(conn, &base)?.tree;
        let source_tree = ObjectStore::get_commit(conn, source_head)?.tree;
        let target_tree = ObjectStore::get_commit(conn, target_head)?.tree;
        let source_changes = DiffEngine::diff(conn, &base_tree, &source_tree)?;
        let target_changes = DiffEngine::diff(conn, &base_tree, &target_tree)?;
        state = state.advance(MergeState::Diffed)?;

        let classifications = ConflictDetector::classify(
            conn,
            &base_tree,
            &source_tree,
            &target_tree,
            &source_changes,
            &target_changes,
        )?;
        state.advance(MergeState::Classified)?;

        Ok(MergePlan {
            source_head: source_head.clone(),
            target_head: target_head.clone(),
            base,
            base_tree,
            source_tree,
            target_tree,
            classifications,
        })
    }

    /// Merge `source_ref` into `target_ref`.
    ///
    /// Heads are read first, then the result is persisted in one transaction
    /// whose final compare-and-swap expects the target head that was read.
    pub fn request_merge(
        &self,
        db: &Database,
        source_ref: &str,
        target_ref: &str,
        requested_by: &str,
    ) -> Result<MergeOutcome, MergeError> {
        info!(source_ref, target_ref, requested_by, "merge requested");

        let result = self.try_request(db, source_ref, target_ref, requested_by);
        if let Err(e) = &result {
            record_failure(db, "merge_requested", target_ref, requested_by, e);
        }
        result
    }

    fn try_request(
        &self,
        db: &Database,
        source_ref: &str,
        target_ref: &str,
        requested_by: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let plan = {
            let conn = db.conn();
            let source_head = self.refs.resolve(&conn, source_ref)?;
            let target_head = self.refs.resolve(&conn, target_ref)?;
            self.plan(&conn, &source_head, &target_head)?
        };
        db.transaction(|conn| self.persist_request(conn, &plan, source_ref, target_ref, requested_by))
    }

    fn persist_request(
        &self,
        conn: &Connection,
        plan: &MergePlan,
        source_ref: &str,
        target_ref: &str,
        requested_by: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let merge_id = Uuid::new_v4().to_string();
        queries::insert_merge_operation(
            conn,
            &MergeOperationRow {
                id: merge_id.clone(),
                source_ref: source_ref.to_string(),
                target_ref: target_ref.to_string(),
                source_head: plan.source_head.to_string(),
                target_head: plan.target_head.to_string(),
                base_commit: plan.base.to_string(),
                status: MergeStatus::Pending.as_str().to_string(),
                requested_by: requested_by.to_string(),
                result_commit: None,
                created_at: Utc::now().to_rfc3339(),
                completed_at: None,
            },
        )?;
        let state = MergeState::Classified;

        if plan.has_conflicts() {
            for classification in plan.conflicts() {
                let impacted = self.impacted(conn, &classification.key)?;
                let row = conflict::new_conflict_row(conn, &merge_id, classification, &impacted)?;
                queries::insert_conflict(conn, &row)?;
            }
            let state = state.advance(MergeState::AwaitingResolution)?;
            transition(conn, &merge_id, MergeStatus::Pending, state, None)?;

            let conflicts = ConflictResolver::conflicts(conn, &merge_id)?;
            info!(%merge_id, conflicts = conflicts.len(), "merge awaiting resolution");
            let details = format!(
                "{source_ref} -> {target_ref}: {} conflict(s)",
                conflicts.len()
            );
            queries::insert_audit_log(
                conn,
                "merge_requested",
                Some(&merge_id),
                Some(requested_by),
                Some(&details),
                true,
            )?;
            return Ok(MergeOutcome {
                merge_id,
                state,
                base: plan.base.clone(),
                result_commit: None,
                conflicts,
                changes: Vec::new(),
            });
        }

        let state = state.advance(MergeState::AutoMerged)?;
        let (result_commit, changes) = self.complete(
            conn,
            &merge_id,
            plan,
            &[],
            source_ref,
            target_ref,
            requested_by,
        )?;
        let state = state.advance(MergeState::Finalized)?;
        transition(conn, &merge_id, MergeStatus::Pending, state, Some(&result_commit))?;

        info!(%merge_id, result = %result_commit.short(), changes = changes.len(), "merge completed");
        let details = format!(
            "{source_ref} -> {target_ref}: {} change(s), head {}",
            changes.len(),
            result_commit
        );
        queries::insert_audit_log(
            conn,
            "merge_completed",
            Some(&merge_id),
            Some(requested_by),
            Some(&details),
            true,
        )?;
        Ok(MergeOutcome {
            merge_id,
            state,
            base: plan.base.clone(),
            result_commit: Some(result_commit),
            conflicts: Vec::new(),
            changes,
        })
    }

    /// Finish a merge whose conflicts have all been decided.
    ///
    /// The plan is recomputed from the stored heads and the target ref must
    /// still point at the stored target head. On
    /// [`MergeError::ConcurrentRefUpdate`] the merge stays resolving and may
    /// be aborted and requested again.
    pub fn finalize(
        &self,
        db: &Database,
        merge_id: &str,
        committer: Option<&str>,
    ) -> Result<MergeOutcome, MergeError> {
        let committer = committer.unwrap_or(self.config.default_committer.as_str());
        info!(merge_id, committer, "finalizing merge");

        let result: Result<MergeOutcome, MergeError> = db.transaction(|conn| {
            let op = Self::merge_operation(conn, merge_id)?;
            if !op.status.can_transition_to(MergeStatus::Completed) {
                return Err(MergeError::InvalidStateTransition {
                    from: op.status.to_string(),
                    to: MergeStatus::Completed.to_string(),
                });
            }
            let open = ConflictResolver::open_count(conn, merge_id)?;
            if open > 0 {
                return Err(MergeError::ConflictUnresolved {
                    merge_id: merge_id.to_string(),
                    open,
                });
            }

            let plan = self.plan(conn, &op.source_head, &op.target_head)?;
            let decided = ConflictResolver::conflicts(conn, merge_id)?;
            let (result_commit, changes) = self.complete(
                conn,
                merge_id,
                &plan,
                &decided,
                &op.source_ref,
                &op.target_ref,
                committer,
            )?;

            let state = MergeState::from_status(op.status).advance(MergeState::Finalized)?;
            transition(conn, merge_id, op.status, state, Some(&result_commit))?;

            let details = format!(
                "{} -> {}: {} decided conflict(s), head {}",
                op.source_ref,
                op.target_ref,
                decided.len(),
                result_commit
            );
            queries::insert_audit_log(
                conn,
                "merge_finalized",
                Some(merge_id),
                Some(committer),
                Some(&details),
                true,
            )?;
            info!(merge_id, result = %result_commit.short(), "merge finalized");
            Ok(MergeOutcome {
                merge_id: merge_id.to_string(),
                state,
                base: plan.base,
                result_commit: Some(result_commit),
                conflicts: Vec::new(),
                changes,
            })
        });

        if let Err(e) = &result {
            record_failure(db, "merge_finalized", merge_id, committer, e);
        }
        result
    }

    /// Abandon a merge. Refs and objects are left untouched.
    pub fn abort(
        &self,
        db: &Database,
        merge_id: &str,
        actor: &str,
    ) -> Result<MergeOperation, MergeError> {
        info!(merge_id, actor, "aborting merge");
        db.transaction(|conn| {
            let op = Self::merge_operation(conn, merge_id)?;
            let state = MergeState::from_status(op.status).advance(MergeState::Aborted)?;
            transition(conn, merge_id, op.status, state, None)?;
            queries::insert_audit_log(
                conn,
                "merge_aborted",
                Some(merge_id),
                Some(actor),
                Some(&format!("{} -> {}", op.source_ref, op.target_ref)),
                true,
            )?;
            Self::merge_operation(conn, merge_id)
        })
    }

    /// Fetch a merge operation.
    pub fn merge_operation(conn: &Connection, merge_id: &str) -> Result<MergeOperation, MergeError> {
        let row = queries::get_merge_operation(conn, merge_id)?
            .ok_or_else(|| MergeError::NotFound(merge_id.to_string()))?;
        operation_from_row(row)
    }

    /// Merge operations newest first, optionally with one status.
    pub fn list_merge_operations(
        conn: &Connection,
        status: Option<MergeStatus>,
        limit: u32,
    ) -> Result<Vec<MergeOperation>, MergeError> {
        queries::list_merge_operations(conn, status.map(|s| s.as_str()), limit)?
            .into_iter()
            .map(operation_from_row)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Build and record the merge result, then move the target ref.
    /// Returns the new target head and the changes it brings.
    fn complete(
        &self,
        conn: &Connection,
        merge_id: &str,
        plan: &MergePlan,
        decided: &[Conflict],
        source_ref: &str,
        target_ref: &str,
        committer: &str,
    ) -> Result<(ObjectId, Vec<Change>), MergeError> {
        if plan.up_to_date() {
            let current = self.refs.resolve(conn, target_ref)?;
            if current != plan.target_head {
                return Err(MergeError::ConcurrentRefUpdate {
                    target_ref: target_ref.to_string(),
                    expected: plan.target_head.to_string(),
                    actual: current.to_string(),
                });
            }
            debug!(target_ref, "source already merged");
            return Ok((plan.target_head.clone(), Vec::new()));
        }

        let (result, result_tree) = if self.config.fast_forward && plan.can_fast_forward() {
            debug!(target_ref, to = %plan.source_head.short(), "fast-forward");
            (plan.source_head.clone(), plan.source_tree.clone())
        } else {
            let tree = self.merged_tree(conn, merge_id, plan, decided)?;
            let meta = CommitMeta::now(committer, format!("Merge {source_ref} into {target_ref}"));
            let commit = CommitGraph::create_commit(
                conn,
                &tree,
                &[plan.target_head.clone(), plan.source_head.clone()],
                meta,
            )?;
            (commit, tree)
        };

        self.advance_target(conn, target_ref, &plan.target_head, &result)?;

        let mut changes = DiffEngine::diff(conn, &plan.target_tree, &result_tree)?;
        for change in &mut changes {
            change.dependents = self.impacted(conn, &change.key)?;
        }
        Ok((result, changes))
    }

    /// Target tree plus source-side edits and conflict decisions.
    fn merged_tree(
        &self,
        conn: &Connection,
        merge_id: &str,
        plan: &MergePlan,
        decided: &[Conflict],
    ) -> Result<ObjectId, MergeError> {
        let mut editor = TreeEditor::new(plan.target_tree.clone());
        for classification in &plan.classifications {
            match classification.kind {
                ConflictKind::SourceModified => {
                    editor.apply(classification.key.clone(), classification.source.clone());
                }
                ConflictKind::NoConflict | ConflictKind::TargetModified => {}
                ConflictKind::BothModified
                | ConflictKind::DeletedSource
                | ConflictKind::DeletedTarget => {
                    let decision = decided
                        .iter()
                        .find(|c| c.object_key == classification.key)
                        .ok_or_else(|| MergeError::ConflictNotFound {
                            merge_id: merge_id.to_string(),
                            object_key: classification.key.to_string(),
                        })?;
                    editor.apply(
                        classification.key.clone(),
                        conflict::decided_entry(conn, decision)?,
                    );
                }
            }
        }
        Ok(editor.write(conn)?)
    }

    fn advance_target(
        &self,
        conn: &Connection,
        target_ref: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<(), MergeError> {
        match self.refs.update(conn, target_ref, expected, new) {
            Ok(_) => Ok(()),
            Err(RefError::ConcurrentRefUpdate {
                expected, actual, ..
            }) => Err(MergeError::ConcurrentRefUpdate {
                target_ref: target_ref.to_string(),
                expected,
                actual,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn impacted(
        &self,
        conn: &Connection,
        key: &ObjectKey,
    ) -> Result<Vec<crate::dependency::ClosureEntry>, MergeError> {
        Ok(self.deps.impact_of(conn, key, self.deps.max_depth())?.entries)
    }
}

/// Guarded status update of a merge operation from `from` to `to`'s status.
fn transition(
    conn: &Connection,
    merge_id: &str,
    from: MergeStatus,
    to: MergeState,
    result_commit: Option<&ObjectId>,
) -> Result<(), MergeError> {
    let status = to.persisted_status();
    let changed = queries::transition_merge_operation(
        conn,
        merge_id,
        &[from.as_str()],
        status.as_str(),
        result_commit.map(ObjectId::as_str),
        status.is_terminal(),
    )?;
    if changed == 0 {
        return Err(MergeError::InvalidStateTransition {
            from: from.to_string(),
            to: status.to_string(),
        });
    }
    Ok(())
}

/// Audit a failed merge action. Runs after the failed transaction rolled
/// back, so the entry survives.
fn record_failure(db: &Database, action: &str, subject: &str, actor: &str, error: &MergeError) {
    if error.is_retryable() {
        warn!(action, subject, error = %error, "merge lost a concurrent ref update");
    } else {
        warn!(action, subject, error = %error, "merge action failed");
    }
    let details = format!("{error} (retryable: {})", error.is_retryable());
    let conn = db.conn();
    if let Err(e) = queries::insert_audit_log(
        &conn,
        action,
        Some(subject),
        Some(actor),
        Some(&details),
        false,
    ) {
        warn!(error = %e, "failed to write audit entry");
    }
}

fn operation_from_row(row: MergeOperationRow) -> Result<MergeOperation, MergeError> {
    let status = MergeStatus::parse(&row.status).ok_or_else(|| MergeError::Corrupt {
        id: row.id.clone(),
        detail: format!("unknown merge status '{}'", row.status),
    })?;
    let result_commit = row
        .result_commit
        .as_deref()
        .map(ObjectId::from_hex)
        .transpose()?;
    Ok(MergeOperation {
        source_head: ObjectId::from_hex(&row.source_head)?,
        target_head: ObjectId::from_hex(&row.target_head)?,
        base_commit: ObjectId::from_hex(&row.base_commit)?,
        created_at: queries::parse_datetime(&row.created_at),
        completed_at: row.completed_at.as_deref().map(queries::parse_datetime),
        id: row.id,
        source_ref: row.source_ref,
        target_ref: row.target_ref,
        status,
        requested_by: row.requested_by,
        result_commit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefsConfig;
    use crate::models::{ConflictStatus, RefKind, Resolution, Snapshot};
    use crate::ref_policy::RefPolicy;

    fn setup() -> (Database, MergeEngine) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let refs = RefManager::new(RefPolicy::from_config(&RefsConfig::default()).unwrap());
        let engine = MergeEngine::new(MergeConfig::default(), refs, DependencyResolver::new(10));
        (db, engine)
    }

    fn commit(conn: &Connection, snapshot: &Snapshot, parents: &[ObjectId]) -> ObjectId {
        let tree = ObjectStore::write_snapshot(conn, snapshot).unwrap();
        CommitGraph::create_commit(conn, &tree, parents, CommitMeta::now("alice", "change"))
            .unwrap()
    }

    /// `main` and `feature` diverge from a common base.
    fn diverge(
        db: &Database,
        engine: &MergeEngine,
        base: Snapshot,
        main: Snapshot,
        feature: Snapshot,
    ) -> (ObjectId, ObjectId, ObjectId) {
        let conn = db.conn();
        let a = commit(&conn, &base, &[]);
        let m = commit(&conn, &main, &[a.clone()]);
        let f = commit(&conn, &feature, &[a.clone()]);
        engine.refs.create(&conn, "main", RefKind::Branch, &m).unwrap();
        engine.refs.create(&conn, "feature", RefKind::Branch, &f).unwrap();
        (a, m, f)
    }

    #[test]
    fn test_state_machine_transitions() {
        use MergeState::*;
        assert!(Requested.can_transition_to(BaseResolved));
        assert!(Classified.can_transition_to(AutoMerged));
        assert!(Classified.can_transition_to(AwaitingResolution));
        assert!(AwaitingResolution.can_transition_to(Finalized));
        assert!(Diffed.can_transition_to(Aborted));
        assert!(!Requested.can_transition_to(Diffed));
        assert!(!Finalized.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Finalized));
        assert!(matches!(
            Finalized.advance(Requested),
            Err(MergeError::InvalidStateTransition { .. })
        ));
        assert_eq!(AutoMerged.persisted_status(), MergeStatus::Pending);
        assert_eq!(AwaitingResolution.persisted_status(), MergeStatus::Resolving);
        assert_eq!(Finalized.persisted_status(), MergeStatus::Completed);
    }

    #[test]
    fn test_merge_state_display() {
        assert_eq!(MergeState::AwaitingResolution.to_string(), "awaiting_resolution");
        assert_eq!(MergeState::BaseResolved.to_string(), "base_resolved");
    }

    #[test]
    fn test_clean_merge_creates_two_parent_commit() {
        let (db, engine) = setup();
        let (_, m, f) = diverge(
            &db,
            &engine,
            Snapshot::new().with("t1.a", "int").with("t2.x", "int"),
            Snapshot::new().with("t1.a", "int").with("t2.x", "bigint"),
            Snapshot::new().with("t1.a", "int").with("t1.b", "text").with("t2.x", "int"),
        );

        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();
        assert!(outcome.is_finalized());
        let head = outcome.result_commit.clone().unwrap();

        let conn = db.conn();
        let merged = ObjectStore::get_commit(&conn, &head).unwrap();
        assert_eq!(merged.parents, vec![m, f]);
        assert_eq!(engine.refs.resolve(&conn, "main").unwrap(), head);

        let expected = ObjectStore::write_snapshot(
            &conn,
            &Snapshot::new()
                .with("t1.a", "int")
                .with("t1.b", "text")
                .with("t2.x", "bigint"),
        )
        .unwrap();
        assert_eq!(merged.tree, expected);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].key, ObjectKey::parse("t1.b"));

        let op = MergeEngine::merge_operation(&conn, &outcome.merge_id).unwrap();
        assert_eq!(op.status, MergeStatus::Completed);
        assert_eq!(op.result_commit, Some(head));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn test_fast_forward_when_enabled() {
        let (db, mut engine) = setup();
        engine.config.fast_forward = true;
        let f = {
            let conn = db.conn();
            let a = commit(&conn, &Snapshot::new().with("t1.a", "int"), &[]);
            let f = commit(&conn, &Snapshot::new().with("t1.a", "bigint"), &[a.clone()]);
            engine.refs.create(&conn, "main", RefKind::Branch, &a).unwrap();
            engine.refs.create(&conn, "feature", RefKind::Branch, &f).unwrap();
            f
        };

        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();
        assert_eq!(outcome.result_commit, Some(f.clone()));
        assert_eq!(engine.refs.resolve(&db.conn(), "main").unwrap(), f);
    }

    #[test]
    fn test_unchanged_target_takes_source_removals() {
        let (db, engine) = setup();
        let (a, f) = {
            let conn = db.conn();
            let a = commit(&conn, &Snapshot::new().with("t1.a", "int").with("t2.x", "int"), &[]);
            let f = commit(&conn, &Snapshot::new().with("t2.x", "int"), &[a.clone()]);
            engine.refs.create(&conn, "main", RefKind::Branch, &a).unwrap();
            engine.refs.create(&conn, "feature", RefKind::Branch, &f).unwrap();
            (a, f)
        };

        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();
        assert!(outcome.is_finalized());
        assert!(outcome.conflicts.is_empty());

        let conn = db.conn();
        let head = outcome.result_commit.unwrap();
        let merged = ObjectStore::get_commit(&conn, &head).unwrap();
        assert_eq!(merged.parents, vec![a, f.clone()]);
        assert_eq!(merged.tree, ObjectStore::get_commit(&conn, &f).unwrap().tree);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].key, ObjectKey::parse("t1"));
    }

    #[test]
    fn test_merging_an_ancestor_ignores_target_removals() {
        let (db, engine) = setup();
        let m = {
            let conn = db.conn();
            let a = commit(&conn, &Snapshot::new().with("t1.a", "int"), &[]);
            let m = commit(&conn, &Snapshot::new().with("t1.b", "int"), &[a.clone()]);
            engine.refs.create(&conn, "main", RefKind::Branch, &m).unwrap();
            engine.refs.create(&conn, "feature", RefKind::Branch, &a).unwrap();

            let plan = engine.plan(&conn, &a, &m).unwrap();
            assert!(plan.up_to_date());
            assert!(!plan.has_conflicts());
            m
        };

        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();
        assert!(outcome.is_finalized());
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.result_commit, Some(m.clone()));
        assert_eq!(engine.refs.resolve(&db.conn(), "main").unwrap(), m);
    }

    #[test]
    fn test_conflict_then_finalize() {
        let (db, engine) = setup();
        diverge(
            &db,
            &engine,
            Snapshot::new().with("t1.a", "int").with("t1.b", "text"),
            Snapshot::new().with("t1.a", "smallint").with("t1.b", "text"),
            Snapshot::new().with("t1.a", "bigint").with("t1.b", "varchar"),
        );

        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();
        assert_eq!(outcome.state, MergeState::AwaitingResolution);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::BothModified);
        assert!(outcome.result_commit.is_none());

        let err = engine.finalize(&db, &outcome.merge_id, None).unwrap_err();
        assert!(matches!(err, MergeError::ConflictUnresolved { open: 1, .. }));

        ConflictResolver::resolve_one(
            &db,
            &outcome.merge_id,
            &ObjectKey::parse("t1.a"),
            Resolution::TakeSource,
            "bob",
            None,
        )
        .unwrap();
        let done = engine.finalize(&db, &outcome.merge_id, Some("bob")).unwrap();
        assert!(done.is_finalized());

        let conn = db.conn();
        let tree = ObjectStore::get_commit(&conn, done.result_commit.as_ref().unwrap())
            .unwrap()
            .tree;
        let expected = ObjectStore::write_snapshot(
            &conn,
            &Snapshot::new().with("t1.a", "bigint").with("t1.b", "varchar"),
        )
        .unwrap();
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_abort_is_terminal() {
        let (db, engine) = setup();
        let (_, m, _) = diverge(
            &db,
            &engine,
            Snapshot::new().with("t1.a", "int"),
            Snapshot::new().with("t1.a", "smallint"),
            Snapshot::new().with("t1.a", "bigint"),
        );
        let outcome = engine.request_merge(&db, "feature", "main", "alice").unwrap();

        let op = engine.abort(&db, &outcome.merge_id, "alice").unwrap();
        assert_eq!(op.status, MergeStatus::Aborted);
        assert_eq!(engine.refs.resolve(&db.conn(), "main").unwrap(), m);

        assert!(matches!(
            engine.abort(&db, &outcome.merge_id, "alice"),
            Err(MergeError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            engine.finalize(&db, &outcome.merge_id, None),
            Err(MergeError::InvalidStateTransition { .. })
        ));
        let conflicts = ConflictResolver::conflicts(&db.conn(), &outcome.merge_id).unwrap();
        assert_eq!(conflicts[0].status, ConflictStatus::Open);
    }

    #[test]
    fn test_disjoint_histories_persist_nothing() {
        let (db, engine) = setup();
        {
            let conn = db.conn();
            let a = commit(&conn, &Snapshot::new().with("t1.a", "int"), &[]);
            let b = commit(&conn, &Snapshot::new().with("t2.a", "int"), &[]);
            engine.refs.create(&conn, "main", RefKind::Branch, &a).unwrap();
            engine.refs.create(&conn, "other", RefKind::Branch, &b).unwrap();
        }
        assert!(matches!(
            engine.request_merge(&db, "other", "main", "alice"),
            Err(MergeError::NoCommonAncestor { .. })
        ));
        let ops = MergeEngine::list_merge_operations(&db.conn(), None, 10).unwrap();
        assert!(ops.is_empty());

        let audit = db.list_audit_log(1).unwrap();
        assert_eq!(audit[0].action, "merge_requested");
        assert!(!audit[0].success);
        assert!(audit[0]
            .details
            .as_deref()
            .unwrap()
            .ends_with("(retryable: false)"));
    }
}
