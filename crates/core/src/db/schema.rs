//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "object store, refs and commit graph",
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('blob', 'tree', 'commit')),
            payload     BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tree_entries (
            tree        TEXT NOT NULL REFERENCES objects (id),
            name        TEXT NOT NULL,
            child       TEXT NOT NULL REFERENCES objects (id),
            kind        TEXT NOT NULL CHECK (kind IN ('blob', 'tree', 'commit')),
            PRIMARY KEY (tree, name)
        );

        CREATE INDEX IF NOT EXISTS idx_tree_entries_child ON tree_entries (child);

        CREATE TABLE IF NOT EXISTS commit_parents (
            commit_id   TEXT    NOT NULL REFERENCES objects (id),
            parent      TEXT    NOT NULL REFERENCES objects (id),
            ordinal     INTEGER NOT NULL,
            PRIMARY KEY (commit_id, ordinal)
        );

        CREATE INDEX IF NOT EXISTS idx_commit_parents_parent ON commit_parents (parent);

        CREATE TABLE IF NOT EXISTS refs (
            name        TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('branch', 'tag')),
            target      TEXT NOT NULL REFERENCES objects (id),
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "dependency graph",
        r#"
        CREATE TABLE IF NOT EXISTS dependency_edges (
            from_key    TEXT NOT NULL,
            to_key      TEXT NOT NULL,
            relation    TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (from_key, to_key, relation)
        );

        CREATE INDEX IF NOT EXISTS idx_dependency_edges_to ON dependency_edges (to_key);
        "#,
    ),
    (
        3,
        "merge operations, conflicts and audit log",
        r#"
        CREATE TABLE IF NOT EXISTS merge_operations (
            id              TEXT PRIMARY KEY,
            source_ref      TEXT NOT NULL,
            target_ref      TEXT NOT NULL,
            source_head     TEXT NOT NULL REFERENCES objects (id),
            target_head     TEXT NOT NULL REFERENCES objects (id),
            base_commit     TEXT NOT NULL REFERENCES objects (id),
            status          TEXT NOT NULL
                            CHECK (status IN ('pending', 'resolving', 'completed', 'aborted')),
            requested_by    TEXT NOT NULL,
            result_commit   TEXT REFERENCES objects (id),
            created_at      TEXT NOT NULL,
            completed_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_merge_operations_status ON merge_operations (status);

        CREATE TABLE IF NOT EXISTS conflicts (
            id                  TEXT PRIMARY KEY,
            merge_id            TEXT NOT NULL REFERENCES merge_operations (id),
            object_key          TEXT NOT NULL,
            kind                TEXT NOT NULL,
            base_id             TEXT,
            base_kind           TEXT,
            base_payload        BLOB,
            source_id           TEXT,
            source_kind         TEXT,
            source_payload      BLOB,
            target_id           TEXT,
            target_kind         TEXT,
            target_payload      BLOB,
            status              TEXT NOT NULL DEFAULT 'open'
                                CHECK (status IN ('open', 'resolved', 'rejected')),
            resolution          TEXT,
            resolution_payload  BLOB,
            note                TEXT,
            resolved_by         TEXT,
            resolved_at         TEXT,
            impacted            TEXT NOT NULL DEFAULT '[]',
            created_at          TEXT NOT NULL,
            UNIQUE (merge_id, object_key)
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_merge_status ON conflicts (merge_id, status);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            subject     TEXT,
            actor       TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        CREATE INDEX IF NOT EXISTS idx_audit_log_subject ON audit_log (subject);
        "#,
    ),
    (
        4,
        "opaque annotations",
        r#"
        CREATE TABLE IF NOT EXISTS annotations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_kind    TEXT NOT NULL CHECK (subject_kind IN ('commit', 'conflict')),
            subject_id      TEXT NOT NULL,
            key             TEXT NOT NULL,
            value           TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_annotations_subject ON annotations (subject_kind, subject_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 4);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for expected in [
            "objects",
            "tree_entries",
            "commit_parents",
            "refs",
            "dependency_edges",
            "merge_operations",
            "conflicts",
            "audit_log",
            "annotations",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }
}
