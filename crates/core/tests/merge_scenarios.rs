//! End-to-end merge scenarios against a real (in-memory or file-backed)
//! SQLite repository.
//!
//! Each test builds its own history through `commit_snapshot`, the same
//! inbound path a change-capture service uses, then drives merges and
//! conflict resolution through the `Repository` surface.

use std::sync::Arc;
use std::thread;

use schemavc_core::errors::{CoreError, MergeError};
use schemavc_core::models::{ConflictStatus, MergeStatus, ObjectKind, RefKind};
use schemavc_core::{
    ChangeKind, ConflictKind, MergeState, ObjectId, ObjectKey, Relation, Repository, Resolution,
    Snapshot, VcsConfig,
};

// ===========================================================================
// Helpers
// ===========================================================================

fn repo() -> Repository {
    Repository::in_memory(VcsConfig::default()).expect("failed to open repository")
}

fn key(s: &str) -> ObjectKey {
    ObjectKey::parse(s)
}

/// Commit `base` on main and branch `feature` from it.
fn fork(repo: &Repository, base: Snapshot) -> ObjectId {
    let a = repo.commit_snapshot("main", "alice", "base", &base).unwrap();
    repo.create_ref("feature", RefKind::Branch, &a, "alice").unwrap();
    a
}

fn head_tree(repo: &Repository, branch: &str) -> ObjectId {
    let head = repo.resolve(branch).unwrap();
    repo.get_commit(&head).unwrap().tree
}

fn snapshot_tree(repo: &Repository, snapshot: Snapshot) -> ObjectId {
    repo.write_snapshot(&snapshot).unwrap()
}

// ===========================================================================
// Scenario A: clean merge of an added field
// ===========================================================================

#[test]
fn scenario_a_added_field_merges_cleanly() {
    let repo = repo();
    let a = fork(&repo, Snapshot::new().with("t1.a", "int"));
    repo.commit_snapshot(
        "feature",
        "bob",
        "add b",
        &Snapshot::new().with("t1.a", "int").with("t1.b", "text"),
    )
    .unwrap();

    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(outcome.state, MergeState::Finalized);
    assert_eq!(outcome.base, a);
    assert!(outcome.conflicts.is_empty());

    let expected = snapshot_tree(&repo, Snapshot::new().with("t1.a", "int").with("t1.b", "text"));
    assert_eq!(head_tree(&repo, "main"), expected);
    assert_eq!(repo.resolve("main").unwrap(), outcome.result_commit.clone().unwrap());

    assert_eq!(outcome.changes.len(), 1);
    assert_eq!(outcome.changes[0].key, key("t1.b"));
    assert_eq!(outcome.changes[0].kind, ChangeKind::Added);

    let op = repo.merge_operation(&outcome.merge_id).unwrap();
    assert_eq!(op.status, MergeStatus::Completed);
    assert_eq!(op.base_commit, a);
}

// ===========================================================================
// Scenario B: both sides change the same field
// ===========================================================================

#[test]
fn scenario_b_both_modified_surfaces_all_payloads() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    repo.commit_snapshot("main", "alice", "x", &Snapshot::new().with("t1.a", "smallint"))
        .unwrap();
    repo.commit_snapshot("feature", "bob", "y", &Snapshot::new().with("t1.a", "bigint"))
        .unwrap();
    let main_before = repo.resolve("main").unwrap();

    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(outcome.state, MergeState::AwaitingResolution);
    assert_eq!(outcome.conflicts.len(), 1);

    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.object_key, key("t1.a"));
    assert_eq!(conflict.kind, ConflictKind::BothModified);
    assert_eq!(conflict.base.as_ref().unwrap().payload, b"int");
    assert_eq!(conflict.source.as_ref().unwrap().payload, b"bigint");
    assert_eq!(conflict.target.as_ref().unwrap().payload, b"smallint");
    assert!(conflict.unified_diff().contains("+bigint"));

    // Nothing moves until finalize.
    assert_eq!(repo.resolve("main").unwrap(), main_before);
    assert_eq!(
        repo.merge_operation(&outcome.merge_id).unwrap().status,
        MergeStatus::Resolving
    );
}

// ===========================================================================
// Scenario C: deletion against modification
// ===========================================================================

#[test]
fn scenario_c_delete_vs_modify_depends_on_direction() {
    let repo = repo();
    fork(
        &repo,
        Snapshot::new().with("t1.a", "int").with("v1", "select 1"),
    );
    repo.commit_snapshot("feature", "bob", "drop t1", &Snapshot::new().with("v1", "select 1"))
        .unwrap();
    repo.commit_snapshot(
        "main",
        "alice",
        "add c",
        &Snapshot::new()
            .with("t1.a", "int")
            .with("t1.c", "date")
            .with("v1", "select 1"),
    )
    .unwrap();

    let into_main = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(into_main.conflicts.len(), 1);
    assert_eq!(into_main.conflicts[0].object_key, key("t1"));
    assert_eq!(into_main.conflicts[0].kind, ConflictKind::DeletedSource);
    assert!(into_main.conflicts[0].source.is_none());
    assert_eq!(
        into_main.conflicts[0].target.as_ref().unwrap().kind,
        ObjectKind::Tree
    );

    let into_feature = repo.request_merge("main", "feature", "alice").unwrap();
    assert_eq!(into_feature.conflicts.len(), 1);
    assert_eq!(into_feature.conflicts[0].kind, ConflictKind::DeletedTarget);

    // Keeping main's table carries the new column into the result.
    repo.resolve_one(&into_main.merge_id, &key("t1"), Resolution::TakeTarget, "alice", None)
        .unwrap();
    let done = repo.finalize(&into_main.merge_id, Some("alice")).unwrap();
    assert!(done.is_finalized());
    let expected = snapshot_tree(
        &repo,
        Snapshot::new()
            .with("t1.a", "int")
            .with("t1.c", "date")
            .with("v1", "select 1"),
    );
    assert_eq!(head_tree(&repo, "main"), expected);
    assert!(done.changes.is_empty());
}

// ===========================================================================
// Scenario D: bounded closure over a cyclic graph
// ===========================================================================

#[test]
fn scenario_d_closure_terminates_on_cycle() {
    let repo = repo();
    repo.add_edge(&key("t1"), &key("idx1"), Relation::Indexes).unwrap();
    repo.add_edge(&key("t1"), &key("view1"), Relation::DerivesFrom).unwrap();
    repo.add_edge(&key("view1"), &key("view2"), Relation::DerivesFrom).unwrap();
    repo.add_edge(&key("view2"), &key("t1"), Relation::References).unwrap();

    let closure = repo.transitive_closure(&key("t1"), 10).unwrap();
    let found: Vec<(String, usize)> = closure
        .entries
        .iter()
        .map(|e| (e.key.to_string(), e.depth))
        .collect();
    assert_eq!(
        found,
        vec![
            ("idx1".to_string(), 1),
            ("view1".to_string(), 1),
            ("view2".to_string(), 2),
        ]
    );
    assert!(!closure.truncated);
    assert!(closure.exceeded_depth().is_none());

    let shallow = repo.transitive_closure(&key("t1"), 1).unwrap();
    assert!(shallow.truncated);
    assert!(shallow.exceeded_depth().is_some());
    assert!(!shallow.contains(&key("view2")));
}

// ===========================================================================
// Properties
// ===========================================================================

#[test]
fn merge_base_is_symmetric_on_criss_cross() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    let m1 = repo
        .commit_snapshot("main", "alice", "m1", &Snapshot::new().with("t1.a", "int").with("m", "1"))
        .unwrap();
    let f1 = repo
        .commit_snapshot("feature", "bob", "f1", &Snapshot::new().with("t1.a", "int").with("f", "1"))
        .unwrap();
    // Merge each side into the other.
    repo.request_merge("feature", "main", "alice").unwrap();
    repo.request_merge("main", "feature", "bob").unwrap();

    let main = repo.resolve("main").unwrap();
    let feature = repo.resolve("feature").unwrap();
    let ab = repo.merge_base(&main, &feature).unwrap();
    let ba = repo.merge_base(&feature, &main).unwrap();
    assert_eq!(ab, ba);
    assert!(ab == main || ab == m1 || ab == f1);
}

#[test]
fn diff_of_tree_with_itself_is_empty() {
    let repo = repo();
    let tree = snapshot_tree(
        &repo,
        Snapshot::new().with("public.t1.a", "int").with("public.v1", "select 1"),
    );
    assert!(repo.diff(&tree, &tree).unwrap().is_empty());
}

#[test]
fn every_commit_tree_is_readable() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    let head = repo
        .commit_snapshot("main", "alice", "b", &Snapshot::new().with("t1.b", "int"))
        .unwrap();
    for entry in repo.history(&head, 10).unwrap() {
        assert!(repo.get_tree(&entry.commit.tree).is_ok());
    }
}

#[test]
fn merging_a_branch_into_itself_changes_nothing() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    let head = repo.resolve("main").unwrap();

    let outcome = repo.request_merge("main", "main", "alice").unwrap();
    assert!(outcome.is_finalized());
    assert!(outcome.conflicts.is_empty());
    assert!(outcome.changes.is_empty());
    assert_eq!(outcome.result_commit, Some(head.clone()));
    assert_eq!(repo.resolve("main").unwrap(), head);

    // An unchanged branch merged into its ancestor's descendant.
    repo.commit_snapshot("main", "alice", "b", &Snapshot::new().with("t1.b", "int"))
        .unwrap();
    let main = repo.resolve("main").unwrap();
    let stale = repo.request_merge("feature", "main", "alice").unwrap();
    assert!(stale.conflicts.is_empty());
    assert_eq!(repo.resolve("main").unwrap(), main);
}

#[test]
fn every_touched_key_is_classified() {
    let repo = repo();
    fork(
        &repo,
        Snapshot::new()
            .with("t1.a", "int")
            .with("t1.b", "int")
            .with("t2.a", "int")
            .with("t3.a", "int"),
    );
    repo.commit_snapshot(
        "main",
        "alice",
        "m",
        &Snapshot::new()
            .with("t1.a", "smallint")
            .with("t1.b", "int")
            .with("t2.a", "int")
            .with("t4.a", "int"),
    )
    .unwrap();
    repo.commit_snapshot(
        "feature",
        "bob",
        "f",
        &Snapshot::new()
            .with("t1.a", "bigint")
            .with("t1.b", "text")
            .with("t4.a", "int"),
    )
    .unwrap();

    let plan = repo.preview_merge("feature", "main").unwrap();
    let kinds: Vec<(String, ConflictKind)> = plan
        .classifications
        .iter()
        .map(|c| (c.key.to_string(), c.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("t1.a".to_string(), ConflictKind::BothModified),
            ("t1.b".to_string(), ConflictKind::SourceModified),
            ("t2".to_string(), ConflictKind::DeletedSource),
            ("t3".to_string(), ConflictKind::DeletedSource),
            ("t4".to_string(), ConflictKind::NoConflict),
        ]
    );
    assert!(repo.list_merge_operations(None, 10).unwrap().is_empty());
}

#[test]
fn batch_resolution_is_atomic() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int").with("t1.b", "int"));
    repo.commit_snapshot(
        "main",
        "alice",
        "m",
        &Snapshot::new().with("t1.a", "smallint").with("t1.b", "smallint"),
    )
    .unwrap();
    repo.commit_snapshot(
        "feature",
        "bob",
        "f",
        &Snapshot::new().with("t1.a", "bigint").with("t1.b", "bigint"),
    )
    .unwrap();
    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(outcome.conflicts.len(), 2);

    let err = repo
        .resolve_batch(
            &outcome.merge_id,
            &[key("t1.a"), key("t1.zzz")],
            Resolution::TakeSource,
            "bob",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Merge(MergeError::InvalidBatch { .. })));
    assert!(repo
        .conflicts(&outcome.merge_id)
        .unwrap()
        .iter()
        .all(|c| c.status == ConflictStatus::Open));

    repo.resolve_batch(
        &outcome.merge_id,
        &[key("t1.a"), key("t1.b")],
        Resolution::TakeSource,
        "bob",
        Some("feature wins"),
    )
    .unwrap();
    let done = repo.finalize(&outcome.merge_id, None).unwrap();
    let head = repo.get_commit(done.result_commit.as_ref().unwrap()).unwrap();
    assert_eq!(head.author, "schemavc");
    assert_eq!(
        head.tree,
        snapshot_tree(&repo, Snapshot::new().with("t1.a", "bigint").with("t1.b", "bigint"))
    );
}

#[test]
fn finalize_waits_for_every_conflict_and_applies_decisions() {
    let repo = repo();
    fork(
        &repo,
        Snapshot::new()
            .with("t1.a", "int")
            .with("t1.b", "int")
            .with("t2.x", "int"),
    );
    repo.add_edge(&key("t1"), &key("v1"), Relation::DerivesFrom).unwrap();
    repo.commit_snapshot(
        "main",
        "alice",
        "m",
        &Snapshot::new()
            .with("t1.a", "smallint")
            .with("t1.b", "smallint")
            .with("t2.x", "int"),
    )
    .unwrap();
    repo.commit_snapshot(
        "feature",
        "bob",
        "f",
        &Snapshot::new()
            .with("t1.a", "bigint")
            .with("t1.b", "bigint")
            .with("t2.x", "uuid"),
    )
    .unwrap();

    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(outcome.conflicts.len(), 2);
    assert!(outcome.conflicts[0].impacted.iter().any(|e| e.key == key("v1")));

    repo.resolve_one(
        &outcome.merge_id,
        &key("t1.a"),
        Resolution::Custom(b"numeric".to_vec()),
        "carol",
        Some("widest type"),
    )
    .unwrap();
    let err = repo.finalize(&outcome.merge_id, Some("carol")).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Merge(MergeError::ConflictUnresolved { open: 1, .. })
    ));
    assert!(!err.is_retryable());

    repo.reject(&outcome.merge_id, &key("t1.b"), "carol", Some("keep original"))
        .unwrap();
    let done = repo.finalize(&outcome.merge_id, Some("carol")).unwrap();

    let expected = snapshot_tree(
        &repo,
        Snapshot::new()
            .with("t1.a", "numeric")
            .with("t1.b", "int")
            .with("t2.x", "uuid"),
    );
    assert_eq!(head_tree(&repo, "main"), expected);

    let changed: Vec<String> = done.changes.iter().map(|c| c.key.to_string()).collect();
    assert_eq!(changed, vec!["t1.a", "t1.b", "t2.x"]);
    assert!(done.changes[0].dependents.iter().any(|e| e.key == key("v1")));

    let actions: Vec<String> = repo
        .audit_log_for(&outcome.merge_id)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            "merge_requested",
            "conflict_resolved",
            "merge_finalized",
            "conflict_rejected",
            "merge_finalized"
        ]
    );
}

#[test]
fn moved_target_fails_finalize_and_keeps_merge_resolving() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    repo.commit_snapshot("main", "alice", "m", &Snapshot::new().with("t1.a", "smallint"))
        .unwrap();
    repo.commit_snapshot("feature", "bob", "f", &Snapshot::new().with("t1.a", "bigint"))
        .unwrap();
    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    repo.resolve_one(&outcome.merge_id, &key("t1.a"), Resolution::TakeSource, "bob", None)
        .unwrap();

    let moved = repo
        .commit_snapshot("main", "alice", "hotfix", &Snapshot::new().with("t1.a", "integer"))
        .unwrap();
    let err = repo.finalize(&outcome.merge_id, None).unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(repo.resolve("main").unwrap(), moved);
    let failed = repo.audit_log(1).unwrap();
    assert_eq!(failed[0].action, "merge_finalized");
    assert!(!failed[0].success);
    assert!(failed[0].details.as_deref().unwrap().ends_with("(retryable: true)"));
    assert_eq!(
        repo.merge_operation(&outcome.merge_id).unwrap().status,
        MergeStatus::Resolving
    );

    // The caller aborts and recomputes against the new head.
    repo.abort(&outcome.merge_id, "bob").unwrap();
    let retry = repo.request_merge("feature", "main", "bob").unwrap();
    assert_eq!(retry.conflicts.len(), 1);
    assert_eq!(retry.conflicts[0].target.as_ref().unwrap().payload, b"integer");
}

#[test]
fn abort_leaves_refs_and_objects_untouched() {
    let repo = repo();
    fork(&repo, Snapshot::new().with("t1.a", "int"));
    repo.commit_snapshot("main", "alice", "m", &Snapshot::new().with("t1.a", "smallint"))
        .unwrap();
    repo.commit_snapshot("feature", "bob", "f", &Snapshot::new().with("t1.a", "bigint"))
        .unwrap();
    let main = repo.resolve("main").unwrap();
    let feature = repo.resolve("feature").unwrap();

    let outcome = repo.request_merge("feature", "main", "bob").unwrap();
    let objects = repo.database().count_objects().unwrap();

    let op = repo.abort(&outcome.merge_id, "bob").unwrap();
    assert_eq!(op.status, MergeStatus::Aborted);
    assert!(op.result_commit.is_none());
    assert_eq!(repo.resolve("main").unwrap(), main);
    assert_eq!(repo.resolve("feature").unwrap(), feature);
    assert_eq!(repo.database().count_objects().unwrap(), objects);

    assert!(matches!(
        repo.resolve_one(&outcome.merge_id, &key("t1.a"), Resolution::TakeSource, "bob", None),
        Err(CoreError::Merge(MergeError::InvalidStateTransition { .. }))
    ));
    assert_eq!(
        repo.list_merge_operations(Some(MergeStatus::Aborted), 10)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn concurrent_merges_retry_until_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = VcsConfig::default();
    config.store.database_path = dir.path().join("concurrent.db");
    let repo = Arc::new(Repository::open(config).unwrap());

    fork(&repo, Snapshot::new().with("t0.a", "int"));
    let base = repo.resolve("main").unwrap();
    let branches: Vec<String> = (1..=4).map(|i| format!("feature-{i}")).collect();
    for (i, name) in branches.iter().enumerate() {
        repo.create_ref(name, RefKind::Branch, &base, "alice").unwrap();
        repo.commit_snapshot(
            name,
            "alice",
            "add table",
            &Snapshot::new()
                .with("t0.a", "int")
                .with(&format!("t{}.a", i + 1), "int"),
        )
        .unwrap();
    }

    let handles: Vec<_> = branches
        .into_iter()
        .map(|name| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                for _ in 0..50 {
                    match repo.request_merge(&name, "main", "worker") {
                        Ok(outcome) => {
                            assert!(outcome.is_finalized());
                            return;
                        }
                        Err(e) if e.is_retryable() => continue,
                        Err(e) => panic!("merge of {name} failed: {e}"),
                    }
                }
                panic!("merge of {name} never landed");
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let tree = head_tree(&repo, "main");
    for i in 0..=4 {
        assert!(repo.lookup(&tree, &key(&format!("t{i}.a"))).unwrap().is_some());
    }
    assert_eq!(
        repo.list_merge_operations(Some(MergeStatus::Completed), 10)
            .unwrap()
            .len(),
        4
    );
}
