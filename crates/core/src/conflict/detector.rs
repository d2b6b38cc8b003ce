//! Six-way classification of keys touched by a three-way merge.
//!
//! Given the diffs base→source and base→target, every touched key is
//! classified by comparing its base, source and target entries. A key that
//! lies below a key touched by either side is folded into that ancestor, so
//! a removed table and a column added to it yield one classification.
//!
//! When one side has no net changes the merge is one-sided: every touched
//! key takes the changed side's value and nothing conflicts.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::Change;
use crate::errors::StoreError;
use crate::models::{ConflictKind, ObjectId, ObjectKey, TreeEntry};
use crate::store::ObjectStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What one side did to a key relative to the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideChange {
    Unchanged,
    Changed,
    Removed,
}

impl SideChange {
    pub fn of(base: Option<&TreeEntry>, side: Option<&TreeEntry>) -> Self {
        match (base, side) {
            (None, None) => Self::Unchanged,
            (Some(b), Some(s)) if b.same_target(s) => Self::Unchanged,
            (Some(_), None) => Self::Removed,
            _ => Self::Changed,
        }
    }
}

/// The classification of one key, with the entry each side holds there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub key: ObjectKey,
    pub kind: ConflictKind,
    pub base: Option<TreeEntry>,
    pub source: Option<TreeEntry>,
    pub target: Option<TreeEntry>,
}

impl Classification {
    pub fn is_conflict(&self) -> bool {
        self.kind.is_conflict()
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless classifier over three trees.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify every key touched by `source_changes` or `target_changes`.
    /// Results are sorted by key.
    pub fn classify(
        conn: &Connection,
        base_tree: &ObjectId,
        source_tree: &ObjectId,
        target_tree: &ObjectId,
        source_changes: &[Change],
        target_changes: &[Change],
    ) -> Result<Vec<Classification>, StoreError> {
        let keys = group_keys(source_changes, target_changes);
        info!(
            source_changes = source_changes.len(),
            target_changes = target_changes.len(),
            keys = keys.len(),
            "classifying merge keys"
        );

        let one_sided = source_changes.is_empty() || target_changes.is_empty();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let base = ObjectStore::lookup(conn, base_tree, &key)?;
            let source = ObjectStore::lookup(conn, source_tree, &key)?;
            let target = ObjectStore::lookup(conn, target_tree, &key)?;
            let kind = if one_sided {
                classify_one_sided(base.as_ref(), source.as_ref(), target.as_ref())
            } else {
                classify_sides(base.as_ref(), source.as_ref(), target.as_ref())
            };
            debug!(%key, kind = kind.as_str(), "classified");
            out.push(Classification {
                key,
                kind,
                base,
                source,
                target,
            });
        }

        let conflicts = out.iter().filter(|c| c.is_conflict()).count();
        info!(count = conflicts, "conflict detection complete");
        Ok(out)
    }
}

/// Union of touched keys with every key that has a touched proper ancestor
/// removed. Returned in key order.
pub fn group_keys(source_changes: &[Change], target_changes: &[Change]) -> Vec<ObjectKey> {
    let touched: BTreeSet<&ObjectKey> = source_changes
        .iter()
        .chain(target_changes)
        .map(|c| &c.key)
        .collect();

    touched
        .iter()
        .filter(|key| !key.ancestors().iter().any(|a| touched.contains(a)))
        .map(|key| (*key).clone())
        .collect()
}

/// Classify one key from its base, source and target entries.
pub fn classify_sides(
    base: Option<&TreeEntry>,
    source: Option<&TreeEntry>,
    target: Option<&TreeEntry>,
) -> ConflictKind {
    use SideChange::*;

    match (SideChange::of(base, source), SideChange::of(base, target)) {
        (Unchanged, Unchanged) => ConflictKind::NoConflict,
        (Removed, _) => ConflictKind::DeletedSource,
        (_, Removed) => ConflictKind::DeletedTarget,
        (Changed, Unchanged) => ConflictKind::SourceModified,
        (Unchanged, Changed) => ConflictKind::TargetModified,
        (Changed, Changed) => match (source, target) {
            (Some(s), Some(t)) if s.same_target(t) => ConflictKind::NoConflict,
            _ => ConflictKind::BothModified,
        },
    }
}

/// Classify a key when only one side changed anything. Removals are taken
/// like any other edit.
pub fn classify_one_sided(
    base: Option<&TreeEntry>,
    source: Option<&TreeEntry>,
    target: Option<&TreeEntry>,
) -> ConflictKind {
    match (SideChange::of(base, source), SideChange::of(base, target)) {
        (SideChange::Unchanged, SideChange::Unchanged) => ConflictKind::NoConflict,
        (SideChange::Unchanged, _) => ConflictKind::TargetModified,
        _ => ConflictKind::SourceModified,
    }
}
