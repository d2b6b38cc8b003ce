//! Typed query helpers for every table in the schemavc database.
//!
//! Helpers take a `&Connection` (a `Transaction` derefs to one) and return
//! plain row structs; the owning subsystem converts rows into domain types.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `objects` table.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub id: String,
    pub kind: String,
    pub payload: Vec<u8>,
}

/// A row from the `refs` table.
#[derive(Debug, Clone)]
pub struct RefRow {
    pub name: String,
    pub kind: String,
    pub target: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `dependency_edges` table.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub from_key: String,
    pub to_key: String,
    pub relation: String,
}

/// A row from the `merge_operations` table.
#[derive(Debug, Clone)]
pub struct MergeOperationRow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub source_head: String,
    pub target_head: String,
    pub base_commit: String,
    pub status: String,
    pub requested_by: String,
    pub result_commit: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One side (base, source or target) of a conflict row.
#[derive(Debug, Clone, Default)]
pub struct ConflictSideRow {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub payload: Option<Vec<u8>>,
}

/// A row from the `conflicts` table.
#[derive(Debug, Clone)]
pub struct ConflictRow {
    pub id: String,
    pub merge_id: String,
    pub object_key: String,
    pub kind: String,
    pub base: ConflictSideRow,
    pub source: ConflictSideRow,
    pub target: ConflictSideRow,
    pub status: String,
    pub resolution: Option<String>,
    pub resolution_payload: Option<Vec<u8>>,
    pub note: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<String>,
    pub impacted: String,
    pub created_at: String,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogRow {
    pub id: i64,
    pub action: String,
    pub subject: Option<String>,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A row from the `annotations` table.
#[derive(Debug, Clone)]
pub struct AnnotationRow {
    pub id: i64,
    pub subject_kind: String,
    pub subject_id: String,
    pub key: String,
    pub value: String,
    pub created_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

// -- objects ----------------------------------------------------------------

/// Insert an object unless one with the same id exists. Returns `true` if a
/// new row was written.
pub fn insert_object(
    conn: &Connection,
    id: &str,
    kind: &str,
    payload: &[u8],
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO objects (id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, kind, payload, now()],
    )?;
    if changed > 0 {
        debug!(id, kind, size = payload.len(), "inserted object");
    }
    Ok(changed > 0)
}

/// Fetch an object by id.
pub fn get_object(conn: &Connection, id: &str) -> Result<Option<ObjectRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, kind, payload FROM objects WHERE id = ?1",
            params![id],
            |row| {
                Ok(ObjectRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Kind of a stored object, without loading its payload.
pub fn get_object_kind(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    let kind = conn
        .query_row(
            "SELECT kind FROM objects WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(kind)
}

/// Index one tree entry.
pub fn insert_tree_entry(
    conn: &Connection,
    tree: &str,
    name: &str,
    child: &str,
    kind: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO tree_entries (tree, name, child, kind) VALUES (?1, ?2, ?3, ?4)",
        params![tree, name, child, kind],
    )?;
    Ok(())
}

/// Index one commit parent.
pub fn insert_commit_parent(
    conn: &Connection,
    commit: &str,
    parent: &str,
    ordinal: usize,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO commit_parents (commit_id, parent, ordinal) VALUES (?1, ?2, ?3)",
        params![commit, parent, ordinal as i64],
    )?;
    Ok(())
}

/// Parents of a commit in ordinal order.
pub fn list_commit_parents(conn: &Connection, commit: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT parent FROM commit_parents WHERE commit_id = ?1 ORDER BY ordinal")?;
    let parents = stmt
        .query_map(params![commit], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(parents)
}

/// Commits naming `parent` as one of their parents.
pub fn list_commit_children(
    conn: &Connection,
    parent: &str,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT commit_id FROM commit_parents WHERE parent = ?1 ORDER BY commit_id",
    )?;
    let children = stmt
        .query_map(params![parent], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(children)
}

// -- refs -------------------------------------------------------------------

fn map_ref_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefRow> {
    Ok(RefRow {
        name: row.get(0)?,
        kind: row.get(1)?,
        target: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Insert a ref. Returns `false` if the name is already taken.
pub fn insert_ref(
    conn: &Connection,
    name: &str,
    kind: &str,
    target: &str,
) -> Result<bool, DatabaseError> {
    let ts = now();
    let changed = conn.execute(
        "INSERT OR IGNORE INTO refs (name, kind, target, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![name, kind, target, ts],
    )?;
    debug!(name, kind, target, created = changed > 0, "insert ref");
    Ok(changed > 0)
}

/// Fetch a ref by name.
pub fn get_ref(conn: &Connection, name: &str) -> Result<Option<RefRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT name, kind, target, created_at, updated_at FROM refs WHERE name = ?1",
            params![name],
            map_ref_row,
        )
        .optional()?;
    Ok(row)
}

/// Compare-and-swap a ref target. Returns the number of rows changed: 1 when
/// the ref pointed at `expected`, 0 otherwise.
pub fn compare_and_swap_ref(
    conn: &Connection,
    name: &str,
    expected: &str,
    new: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE refs SET target = ?1, updated_at = ?2 WHERE name = ?3 AND target = ?4",
        params![new, now(), name, expected],
    )?;
    debug!(name, expected, new, changed, "compare-and-swap ref");
    Ok(changed)
}

/// Delete a ref. Returns the number of rows removed.
pub fn delete_ref(conn: &Connection, name: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute("DELETE FROM refs WHERE name = ?1", params![name])?;
    Ok(changed)
}

/// List refs ordered by name, optionally filtered by kind.
pub fn list_refs(conn: &Connection, kind: Option<&str>) -> Result<Vec<RefRow>, DatabaseError> {
    let rows = match kind {
        Some(k) => {
            let mut stmt = conn.prepare(
                "SELECT name, kind, target, created_at, updated_at FROM refs
                 WHERE kind = ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map(params![k], map_ref_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT name, kind, target, created_at, updated_at FROM refs ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], map_ref_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

// -- dependency_edges -------------------------------------------------------

fn map_edge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EdgeRow> {
    Ok(EdgeRow {
        from_key: row.get(0)?,
        to_key: row.get(1)?,
        relation: row.get(2)?,
    })
}

/// Insert an edge. Returns `false` if the identical edge already exists.
pub fn insert_edge(
    conn: &Connection,
    from_key: &str,
    to_key: &str,
    relation: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO dependency_edges (from_key, to_key, relation, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![from_key, to_key, relation, now()],
    )?;
    Ok(changed > 0)
}

/// Delete an edge. Returns the number of rows removed.
pub fn delete_edge(
    conn: &Connection,
    from_key: &str,
    to_key: &str,
    relation: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM dependency_edges WHERE from_key = ?1 AND to_key = ?2 AND relation = ?3",
        params![from_key, to_key, relation],
    )?;
    Ok(changed)
}

/// Outgoing edges of a key, ordered for deterministic traversal.
pub fn list_edges_from(conn: &Connection, from_key: &str) -> Result<Vec<EdgeRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT from_key, to_key, relation FROM dependency_edges
         WHERE from_key = ?1 ORDER BY to_key, relation",
    )?;
    let rows = stmt
        .query_map(params![from_key], map_edge_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Incoming edges of a key.
pub fn list_edges_to(conn: &Connection, to_key: &str) -> Result<Vec<EdgeRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT from_key, to_key, relation FROM dependency_edges
         WHERE to_key = ?1 ORDER BY from_key, relation",
    )?;
    let rows = stmt
        .query_map(params![to_key], map_edge_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- merge_operations -------------------------------------------------------

const MERGE_COLUMNS: &str = "id, source_ref, target_ref, source_head, target_head, base_commit,
     status, requested_by, result_commit, created_at, completed_at";

fn map_merge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeOperationRow> {
    Ok(MergeOperationRow {
        id: row.get(0)?,
        source_ref: row.get(1)?,
        target_ref: row.get(2)?,
        source_head: row.get(3)?,
        target_head: row.get(4)?,
        base_commit: row.get(5)?,
        status: row.get(6)?,
        requested_by: row.get(7)?,
        result_commit: row.get(8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

/// Insert a new merge operation row.
pub fn insert_merge_operation(
    conn: &Connection,
    op: &MergeOperationRow,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO merge_operations (id, source_ref, target_ref, source_head, target_head,
         base_commit, status, requested_by, result_commit, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            op.id,
            op.source_ref,
            op.target_ref,
            op.source_head,
            op.target_head,
            op.base_commit,
            op.status,
            op.requested_by,
            op.result_commit,
            op.created_at,
            op.completed_at
        ],
    )?;
    debug!(id = %op.id, status = %op.status, "inserted merge operation");
    Ok(())
}

/// Fetch a merge operation by id.
pub fn get_merge_operation(
    conn: &Connection,
    id: &str,
) -> Result<Option<MergeOperationRow>, DatabaseError> {
    let sql = format!("SELECT {MERGE_COLUMNS} FROM merge_operations WHERE id = ?1");
    let row = conn.query_row(&sql, params![id], map_merge_row).optional()?;
    Ok(row)
}

/// Move a merge operation to `status` if it is currently in one of `from`.
/// Returns the number of rows changed (0 when the guard did not match).
pub fn transition_merge_operation(
    conn: &Connection,
    id: &str,
    from: &[&str],
    status: &str,
    result_commit: Option<&str>,
    completed: bool,
) -> Result<usize, DatabaseError> {
    let completed_at = completed.then(now);
    let mut changed = 0;
    for current in from {
        changed += conn.execute(
            "UPDATE merge_operations
             SET status = ?1,
                 result_commit = COALESCE(?2, result_commit),
                 completed_at = COALESCE(?3, completed_at)
             WHERE id = ?4 AND status = ?5",
            params![status, result_commit, completed_at, id, current],
        )?;
        if changed > 0 {
            break;
        }
    }
    debug!(id, status, changed, "merge operation transition");
    Ok(changed)
}

/// List merge operations newest first, optionally filtered by status.
pub fn list_merge_operations(
    conn: &Connection,
    status: Option<&str>,
    limit: u32,
) -> Result<Vec<MergeOperationRow>, DatabaseError> {
    let rows = match status {
        Some(s) => {
            let sql = format!(
                "SELECT {MERGE_COLUMNS} FROM merge_operations
                 WHERE status = ?1 ORDER BY created_at DESC, id LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![s, limit], map_merge_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {MERGE_COLUMNS} FROM merge_operations
                 ORDER BY created_at DESC, id LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], map_merge_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

// -- conflicts --------------------------------------------------------------

const CONFLICT_COLUMNS: &str = "id, merge_id, object_key, kind,
     base_id, base_kind, base_payload, source_id, source_kind, source_payload,
     target_id, target_kind, target_payload, status, resolution, resolution_payload,
     note, resolved_by, resolved_at, impacted, created_at";

fn map_conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRow> {
    Ok(ConflictRow {
        id: row.get(0)?,
        merge_id: row.get(1)?,
        object_key: row.get(2)?,
        kind: row.get(3)?,
        base: ConflictSideRow {
            id: row.get(4)?,
            kind: row.get(5)?,
            payload: row.get(6)?,
        },
        source: ConflictSideRow {
            id: row.get(7)?,
            kind: row.get(8)?,
            payload: row.get(9)?,
        },
        target: ConflictSideRow {
            id: row.get(10)?,
            kind: row.get(11)?,
            payload: row.get(12)?,
        },
        status: row.get(13)?,
        resolution: row.get(14)?,
        resolution_payload: row.get(15)?,
        note: row.get(16)?,
        resolved_by: row.get(17)?,
        resolved_at: row.get(18)?,
        impacted: row.get(19)?,
        created_at: row.get(20)?,
    })
}

/// Insert a new conflict record.
pub fn insert_conflict(conn: &Connection, c: &ConflictRow) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO conflicts ({CONFLICT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            c.id,
            c.merge_id,
            c.object_key,
            c.kind,
            c.base.id,
            c.base.kind,
            c.base.payload,
            c.source.id,
            c.source.kind,
            c.source.payload,
            c.target.id,
            c.target.kind,
            c.target.payload,
            c.status,
            c.resolution,
            c.resolution_payload,
            c.note,
            c.resolved_by,
            c.resolved_at,
            c.impacted,
            c.created_at
        ],
    )?;
    debug!(id = %c.id, merge_id = %c.merge_id, object_key = %c.object_key, kind = %c.kind, "inserted conflict");
    Ok(())
}

/// All conflicts of a merge, ordered by key.
pub fn list_conflicts(conn: &Connection, merge_id: &str) -> Result<Vec<ConflictRow>, DatabaseError> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE merge_id = ?1 ORDER BY object_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![merge_id], map_conflict_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The conflict of a merge on one object key.
pub fn get_conflict_by_key(
    conn: &Connection,
    merge_id: &str,
    object_key: &str,
) -> Result<Option<ConflictRow>, DatabaseError> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE merge_id = ?1 AND object_key = ?2"
    );
    let row = conn
        .query_row(&sql, params![merge_id, object_key], map_conflict_row)
        .optional()?;
    Ok(row)
}

/// A conflict by its own id.
pub fn get_conflict(conn: &Connection, id: &str) -> Result<Option<ConflictRow>, DatabaseError> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
    let row = conn.query_row(&sql, params![id], map_conflict_row).optional()?;
    Ok(row)
}

/// Close an open conflict. Returns the number of rows changed: 0 when the
/// conflict is missing or no longer open.
#[allow(clippy::too_many_arguments)]
pub fn close_conflict(
    conn: &Connection,
    merge_id: &str,
    object_key: &str,
    status: &str,
    resolution: Option<&str>,
    resolution_payload: Option<&[u8]>,
    note: Option<&str>,
    resolved_by: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE conflicts
         SET status = ?1, resolution = ?2, resolution_payload = ?3, note = ?4,
             resolved_by = ?5, resolved_at = ?6
         WHERE merge_id = ?7 AND object_key = ?8 AND status = 'open'",
        params![
            status,
            resolution,
            resolution_payload,
            note,
            resolved_by,
            now(),
            merge_id,
            object_key
        ],
    )?;
    debug!(merge_id, object_key, status, changed, "closed conflict");
    Ok(changed)
}

/// Number of conflicts of a merge still open.
pub fn count_open_conflicts(conn: &Connection, merge_id: &str) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM conflicts WHERE merge_id = ?1 AND status = 'open'",
        params![merge_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// -- audit_log --------------------------------------------------------------

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogRow> {
    Ok(AuditLogRow {
        id: row.get(0)?,
        action: row.get(1)?,
        subject: row.get(2)?,
        actor: row.get(3)?,
        details: row.get(4)?,
        success: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

/// Insert an audit-log entry.
pub fn insert_audit_log(
    conn: &Connection,
    action: &str,
    subject: Option<&str>,
    actor: Option<&str>,
    details: Option<&str>,
    success: bool,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (action, subject, actor, details, success, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![action, subject, actor, details, success as i64, now()],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, action, "inserted audit_log entry");
    Ok(id)
}

/// Recent audit-log entries, newest first.
pub fn list_audit_log(conn: &Connection, limit: u32) -> Result<Vec<AuditLogRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, action, subject, actor, details, success, created_at
         FROM audit_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], map_audit_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Audit-log entries about one subject, oldest first.
pub fn list_audit_log_for_subject(
    conn: &Connection,
    subject: &str,
) -> Result<Vec<AuditLogRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, action, subject, actor, details, success, created_at
         FROM audit_log WHERE subject = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![subject], map_audit_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- annotations ------------------------------------------------------------

/// Attach an opaque annotation.
pub fn insert_annotation(
    conn: &Connection,
    subject_kind: &str,
    subject_id: &str,
    key: &str,
    value: &str,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO annotations (subject_kind, subject_id, key, value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![subject_kind, subject_id, key, value, now()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Annotations of one subject in insertion order.
pub fn list_annotations(
    conn: &Connection,
    subject_kind: &str,
    subject_id: &str,
) -> Result<Vec<AnnotationRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_kind, subject_id, key, value, created_at
         FROM annotations WHERE subject_kind = ?1 AND subject_id = ?2 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![subject_kind, subject_id], |row| {
            Ok(AnnotationRow {
                id: row.get(0)?,
                subject_kind: row.get(1)?,
                subject_id: row.get(2)?,
                key: row.get(3)?,
                value: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Convenience wrappers
// ---------------------------------------------------------------------------

impl Database {
    /// Count rows in the `objects` table.
    pub fn count_objects(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogRow>, DatabaseError> {
        list_audit_log(&self.conn(), limit)
    }

    /// Count rows in the `audit_log` table.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Parse a stored RFC 3339 timestamp, returning `Utc::now()` as a fallback if
/// parsing fails.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_object_insert_is_idempotent() {
        let db = setup_db();
        let conn = db.conn();
        assert!(insert_object(&conn, "abc", "blob", b"int").unwrap());
        assert!(!insert_object(&conn, "abc", "blob", b"int").unwrap());
        let row = get_object(&conn, "abc").unwrap().unwrap();
        assert_eq!(row.payload, b"int");
        assert_eq!(get_object_kind(&conn, "abc").unwrap().as_deref(), Some("blob"));
        assert!(get_object(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_ref_compare_and_swap() {
        let db = setup_db();
        let conn = db.conn();
        insert_object(&conn, "c1", "commit", b"{}").unwrap();
        insert_object(&conn, "c2", "commit", b"{}").unwrap();
        assert!(insert_ref(&conn, "main", "branch", "c1").unwrap());
        assert!(!insert_ref(&conn, "main", "branch", "c2").unwrap());

        assert_eq!(compare_and_swap_ref(&conn, "main", "c2", "c1").unwrap(), 0);
        assert_eq!(compare_and_swap_ref(&conn, "main", "c1", "c2").unwrap(), 1);
        assert_eq!(get_ref(&conn, "main").unwrap().unwrap().target, "c2");
        assert_eq!(list_refs(&conn, Some("tag")).unwrap().len(), 0);
        assert_eq!(list_refs(&conn, None).unwrap().len(), 1);
    }

    #[test]
    fn test_edges_crud() {
        let db = setup_db();
        let conn = db.conn();
        assert!(insert_edge(&conn, "t1", "idx1", "indexes").unwrap());
        assert!(!insert_edge(&conn, "t1", "idx1", "indexes").unwrap());
        insert_edge(&conn, "t1", "view1", "derives_from").unwrap();
        assert_eq!(list_edges_from(&conn, "t1").unwrap().len(), 2);
        assert_eq!(list_edges_to(&conn, "idx1").unwrap().len(), 1);
        assert_eq!(delete_edge(&conn, "t1", "idx1", "indexes").unwrap(), 1);
        assert_eq!(list_edges_from(&conn, "t1").unwrap().len(), 1);
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        insert_audit_log(&db.conn(), "ref_created", Some("main"), Some("alice"), None, true)
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject.as_deref(), Some("main"));
        assert_eq!(db.count_audit_log().unwrap(), 1);
    }

    #[test]
    fn test_annotations() {
        let db = setup_db();
        let conn = db.conn();
        insert_annotation(&conn, "commit", "c1", "risk", r#"{"score":3}"#).unwrap();
        insert_annotation(&conn, "commit", "c1", "owner", r#""dba""#).unwrap();
        let rows = list_annotations(&conn, "commit", "c1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "risk");
        assert!(list_annotations(&conn, "conflict", "c1").unwrap().is_empty());
    }
}
