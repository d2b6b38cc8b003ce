//! Conflict classification, merged-tree building, and resolution management.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying every key touched by a merge six ways.
//! 2. **Merging** -- rebuilding the target tree with accepted edits.
//! 3. **Resolution** -- tracking per-conflict decisions until finalize.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{classify_one_sided, classify_sides, group_keys, Classification, ConflictDetector, SideChange};
pub use merger::TreeEditor;
pub use resolver::ConflictResolver;

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use crate::db::queries::{self, ConflictRow, ConflictSideRow};
use crate::dependency::ClosureEntry;
use crate::errors::MergeError;
use crate::models::{
    Conflict, ConflictKind, ConflictStatus, Object, ObjectId, ObjectKey, ObjectKind, Resolution,
    TreeEntry,
};
use crate::store::ObjectStore;

/// Build the row for a new open conflict, loading each side's full object.
pub(crate) fn new_conflict_row(
    conn: &Connection,
    merge_id: &str,
    classification: &Classification,
    impacted: &[ClosureEntry],
) -> Result<ConflictRow, MergeError> {
    Ok(ConflictRow {
        id: Uuid::new_v4().to_string(),
        merge_id: merge_id.to_string(),
        object_key: classification.key.to_string(),
        kind: classification.kind.as_str().to_string(),
        base: side_row(conn, classification.base.as_ref())?,
        source: side_row(conn, classification.source.as_ref())?,
        target: side_row(conn, classification.target.as_ref())?,
        status: ConflictStatus::Open.as_str().to_string(),
        resolution: None,
        resolution_payload: None,
        note: None,
        resolved_by: None,
        resolved_at: None,
        impacted: serde_json::to_string(impacted).map_err(crate::errors::DatabaseError::from)?,
        created_at: Utc::now().to_rfc3339(),
    })
}

fn side_row(conn: &Connection, entry: Option<&TreeEntry>) -> Result<ConflictSideRow, MergeError> {
    let Some(entry) = entry else {
        return Ok(ConflictSideRow::default());
    };
    let object = ObjectStore::get(conn, &entry.id)?;
    Ok(ConflictSideRow {
        id: Some(object.id.to_string()),
        kind: Some(object.kind.to_string()),
        payload: Some(object.payload),
    })
}

/// Convert a stored conflict row into the domain type.
pub(crate) fn conflict_from_row(row: ConflictRow) -> Result<Conflict, MergeError> {
    let corrupt = |detail: String| MergeError::Corrupt {
        id: row.id.clone(),
        detail,
    };

    let kind = ConflictKind::parse(&row.kind)
        .ok_or_else(|| corrupt(format!("unknown conflict kind '{}'", row.kind)))?;
    let status = ConflictStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("unknown conflict status '{}'", row.status)))?;
    let resolution = match &row.resolution {
        Some(label) => Some(
            Resolution::from_parts(label, row.resolution_payload.clone())
                .ok_or_else(|| corrupt(format!("unknown resolution '{label}'")))?,
        ),
        None => None,
    };
    let impacted: Vec<ClosureEntry> = serde_json::from_str(&row.impacted)
        .map_err(|e| corrupt(format!("impacted column: {e}")))?;

    Ok(Conflict {
        base: side_object(&row.id, &row.base)?,
        source: side_object(&row.id, &row.source)?,
        target: side_object(&row.id, &row.target)?,
        object_key: ObjectKey::parse(&row.object_key),
        resolved_at: row.resolved_at.as_deref().map(queries::parse_datetime),
        created_at: queries::parse_datetime(&row.created_at),
        id: row.id,
        merge_id: row.merge_id,
        kind,
        status,
        resolution,
        note: row.note,
        resolved_by: row.resolved_by,
        impacted,
    })
}

fn side_object(conflict_id: &str, side: &ConflictSideRow) -> Result<Option<Object>, MergeError> {
    match (&side.id, &side.kind, &side.payload) {
        (Some(id), Some(kind), Some(payload)) => {
            let kind = ObjectKind::parse(kind).ok_or_else(|| MergeError::Corrupt {
                id: conflict_id.to_string(),
                detail: format!("unknown object kind '{kind}'"),
            })?;
            Ok(Some(Object {
                id: ObjectId::from_hex(id)?,
                kind,
                payload: payload.clone(),
            }))
        }
        (None, None, None) => Ok(None),
        _ => Err(MergeError::Corrupt {
            id: conflict_id.to_string(),
            detail: "partially stored conflict side".into(),
        }),
    }
}

/// Entry to place at a conflict's key once it has been decided, or `None` to
/// leave the key absent.
pub(crate) fn decided_entry(
    conn: &Connection,
    conflict: &Conflict,
) -> Result<Option<TreeEntry>, MergeError> {
    let as_entry = |o: &Option<Object>| {
        o.as_ref()
            .map(|o| TreeEntry::new("_", o.id.clone(), o.kind))
    };
    let entry = match (conflict.status, &conflict.resolution) {
        (ConflictStatus::Rejected, _) => as_entry(&conflict.base),
        (ConflictStatus::Resolved, Some(Resolution::TakeSource)) => as_entry(&conflict.source),
        (ConflictStatus::Resolved, Some(Resolution::TakeTarget)) => as_entry(&conflict.target),
        (ConflictStatus::Resolved, Some(Resolution::Custom(payload))) => {
            let id = ObjectStore::put_blob(conn, payload)?;
            Some(TreeEntry::new("_", id, ObjectKind::Blob))
        }
        (ConflictStatus::Resolved, None) | (ConflictStatus::Open, _) => {
            return Err(MergeError::ConflictUnresolved {
                merge_id: conflict.merge_id.clone(),
                open: 1,
            })
        }
    };
    Ok(entry)
}
