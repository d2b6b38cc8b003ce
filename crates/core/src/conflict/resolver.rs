//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] records decisions on the open conflicts of a
//! merge: take one side, supply a custom value, or reject both changes. Every
//! decision is a single guarded `UPDATE ... WHERE status = 'open'`, so a
//! conflict is decided at most once even under concurrent callers. Applying
//! the decisions is the merge engine's job at finalize time.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::conflict_from_row;
use crate::db::queries;
use crate::db::Database;
use crate::errors::MergeError;
use crate::models::{Conflict, ConflictStatus, MergeStatus, ObjectKey, Resolution};

/// Stateless conflict resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve one conflict of a merge.
    pub fn resolve_one(
        db: &Database,
        merge_id: &str,
        key: &ObjectKey,
        resolution: Resolution,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Conflict, MergeError> {
        info!(merge_id, %key, resolution = resolution.label(), resolved_by, "resolving conflict");
        db.transaction(|conn| {
            ensure_resolving(conn, merge_id)?;
            let conflict = close(
                conn,
                merge_id,
                key,
                ConflictStatus::Resolved,
                Some(&resolution),
                note,
                resolved_by,
            )?;
            audit(conn, "conflict_resolved", merge_id, resolved_by, key, resolution.label())?;
            Ok(conflict)
        })
    }

    /// Resolve several conflicts of a merge the same way, all or nothing.
    ///
    /// Unknown, duplicated or already-decided keys fail the whole batch with
    /// [`MergeError::InvalidBatch`] and nothing is changed.
    pub fn resolve_batch(
        db: &Database,
        merge_id: &str,
        keys: &[ObjectKey],
        resolution: Resolution,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Vec<Conflict>, MergeError> {
        info!(merge_id, count = keys.len(), resolution = resolution.label(), "resolving conflict batch");
        let invalid = |detail: String| MergeError::InvalidBatch {
            merge_id: merge_id.to_string(),
            detail,
        };
        if keys.is_empty() {
            return Err(invalid("empty batch".into()));
        }

        db.transaction(|conn| {
            ensure_resolving(conn, merge_id)?;

            let mut seen = HashSet::new();
            for key in keys {
                if !seen.insert(key) {
                    return Err(invalid(format!("duplicate key '{key}'")));
                }
                match queries::get_conflict_by_key(conn, merge_id, &key.to_string())? {
                    None => return Err(invalid(format!("no conflict on '{key}'"))),
                    Some(row) if row.status != ConflictStatus::Open.as_str() => {
                        return Err(invalid(format!("conflict on '{key}' is already {}", row.status)))
                    }
                    Some(_) => {}
                }
            }

            let mut resolved = Vec::with_capacity(keys.len());
            for key in keys {
                let conflict = close(
                    conn,
                    merge_id,
                    key,
                    ConflictStatus::Resolved,
                    Some(&resolution),
                    note,
                    resolved_by,
                )
                .map_err(|e| invalid(e.to_string()))?;
                audit(conn, "conflict_resolved", merge_id, resolved_by, key, resolution.label())?;
                resolved.push(conflict);
            }
            debug!(merge_id, count = resolved.len(), "batch resolved");
            Ok(resolved)
        })
    }

    /// Refuse both sides' changes to a key; the merged tree keeps the base
    /// value.
    pub fn reject(
        db: &Database,
        merge_id: &str,
        key: &ObjectKey,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<Conflict, MergeError> {
        info!(merge_id, %key, resolved_by, "rejecting conflict");
        db.transaction(|conn| {
            ensure_resolving(conn, merge_id)?;
            let conflict = close(
                conn,
                merge_id,
                key,
                ConflictStatus::Rejected,
                None,
                note,
                resolved_by,
            )?;
            audit(conn, "conflict_rejected", merge_id, resolved_by, key, "keep_base")?;
            Ok(conflict)
        })
    }

    /// All conflicts of a merge, ordered by key.
    pub fn conflicts(conn: &Connection, merge_id: &str) -> Result<Vec<Conflict>, MergeError> {
        queries::list_conflicts(conn, merge_id)?
            .into_iter()
            .map(conflict_from_row)
            .collect()
    }

    /// The conflict of a merge on one key.
    pub fn conflict(
        conn: &Connection,
        merge_id: &str,
        key: &ObjectKey,
    ) -> Result<Conflict, MergeError> {
        let row = queries::get_conflict_by_key(conn, merge_id, &key.to_string())?.ok_or_else(
            || MergeError::ConflictNotFound {
                merge_id: merge_id.to_string(),
                object_key: key.to_string(),
            },
        )?;
        conflict_from_row(row)
    }

    /// Number of conflicts of a merge still open.
    pub fn open_count(conn: &Connection, merge_id: &str) -> Result<usize, MergeError> {
        Ok(queries::count_open_conflicts(conn, merge_id)? as usize)
    }
}

fn ensure_resolving(conn: &Connection, merge_id: &str) -> Result<(), MergeError> {
    let op = queries::get_merge_operation(conn, merge_id)?
        .ok_or_else(|| MergeError::NotFound(merge_id.to_string()))?;
    if op.status != MergeStatus::Resolving.as_str() {
        return Err(MergeError::InvalidStateTransition {
            from: op.status,
            to: MergeStatus::Resolving.as_str().to_string(),
        });
    }
    Ok(())
}

fn close(
    conn: &Connection,
    merge_id: &str,
    key: &ObjectKey,
    status: ConflictStatus,
    resolution: Option<&Resolution>,
    note: Option<&str>,
    resolved_by: &str,
) -> Result<Conflict, MergeError> {
    let object_key = key.to_string();
    let payload = match resolution {
        Some(Resolution::Custom(bytes)) => Some(bytes.as_slice()),
        _ => None,
    };
    let changed = queries::close_conflict(
        conn,
        merge_id,
        &object_key,
        status.as_str(),
        resolution.map(Resolution::label),
        payload,
        note,
        resolved_by,
    )?;

    let row = queries::get_conflict_by_key(conn, merge_id, &object_key)?.ok_or_else(|| {
        MergeError::ConflictNotFound {
            merge_id: merge_id.to_string(),
            object_key: object_key.clone(),
        }
    })?;
    if changed == 0 {
        warn!(merge_id, %object_key, status = %row.status, "conflict already decided");
        return Err(MergeError::AlreadyResolved {
            object_key,
            status: row.status,
        });
    }
    conflict_from_row(row)
}

fn audit(
    conn: &Connection,
    action: &str,
    merge_id: &str,
    actor: &str,
    key: &ObjectKey,
    decision: &str,
) -> Result<(), MergeError> {
    let details = format!("{key}: {decision}");
    queries::insert_audit_log(conn, action, Some(merge_id), Some(actor), Some(&details), true)?;
    Ok(())
}
