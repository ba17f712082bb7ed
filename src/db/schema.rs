//! SQL DDL for the vault tables.
//!
//! Chunk records are hash-partitioned into `chunk_records_p{n}` tables, one per
//! partition. The audit log and `schema_meta` are shared. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// Shared tables: metadata and the append-only audit log.
const SHARED_SCHEMA_SQL: &str = r#"
-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Audit trail. Rows for unscoped attempts carry an empty token.
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_token TEXT NOT NULL,
    chunk_id TEXT,
    operation TEXT NOT NULL CHECK(operation IN
        ('index','query','summarize','entities','delete','audit','verify','purge')),
    success INTEGER NOT NULL CHECK(success IN (0, 1)),
    error_code TEXT,
    request_id TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_log(tenant_token, id);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;
"#;

/// Per-partition chunk table. `{p}` is replaced with the partition table name.
const PARTITION_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS {p} (
    id TEXT PRIMARY KEY,
    tenant_token TEXT NOT NULL CHECK(length(tenant_token) > 0),
    source_document_id TEXT NOT NULL,
    source_kind TEXT NOT NULL CHECK(source_kind IN ('upload','api','message','import')),
    chunk_index INTEGER NOT NULL CHECK(chunk_index >= 0),
    plaintext_vector BLOB NOT NULL,
    cipher_text BLOB NOT NULL,
    cipher_metadata BLOB,
    cipher_vector_backup BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT,
    UNIQUE(tenant_token, source_document_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_{p}_tenant ON {p}(tenant_token);

CREATE TRIGGER IF NOT EXISTS {p}_immutable
BEFORE UPDATE OF id, tenant_token, source_document_id, source_kind, chunk_index, created_at ON {p}
BEGIN
    SELECT RAISE(ABORT, 'chunk identity columns are immutable');
END;
"#;

/// Physical table name for a partition.
pub fn partition_table(partition: u32) -> String {
    format!("chunk_records_p{partition}")
}

/// Initialize all schema tables for `partitions` partitions. Idempotent.
pub fn init_schema(conn: &Connection, partitions: u32) -> rusqlite::Result<()> {
    conn.execute_batch(SHARED_SCHEMA_SQL)?;
    for partition in 0..partitions {
        let ddl = PARTITION_SCHEMA_SQL.replace("{p}", &partition_table(partition));
        conn.execute_batch(&ddl)?;
    }

    // Seed schema metadata on first run
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('partition_count', ?1)",
        [partitions.to_string()],
    )?;
    Ok(())
}

/// Read a `schema_meta` value.
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Partition count the database was created with.
pub fn stored_partition_count(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    Ok(get_meta(conn, "partition_count")?.and_then(|v| v.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn creates_one_table_per_partition() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 3).unwrap();
        let names = table_names(&conn);
        for p in 0..3 {
            assert!(names.contains(&partition_table(p)), "missing partition {p}");
        }
        assert!(!names.contains(&partition_table(3)));
        assert!(names.contains(&"audit_log".to_string()));
        assert_eq!(stored_partition_count(&conn).unwrap(), Some(3));
    }

    #[test]
    fn init_is_idempotent_and_keeps_first_partition_count() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 4).unwrap();
        init_schema(&conn, 4).unwrap();
        assert_eq!(stored_partition_count(&conn).unwrap(), Some(4));
        assert_eq!(get_meta(&conn, "schema_version").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn empty_token_is_rejected_by_check() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1).unwrap();
        let result = conn.execute(
            "INSERT INTO chunk_records_p0 (id, tenant_token, source_document_id, source_kind,
                chunk_index, plaintext_vector, cipher_text, cipher_vector_backup, created_at, updated_at)
             VALUES ('c1', '', 'doc', 'api', 0, x'00', x'00', x'00', 't', 't')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn identity_columns_are_immutable() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO chunk_records_p0 (id, tenant_token, source_document_id, source_kind,
                chunk_index, plaintext_vector, cipher_text, cipher_vector_backup, created_at, updated_at)
             VALUES ('c1', 'tok', 'doc', 'api', 0, x'00', x'00', x'00', 't', 't')",
            [],
        )
        .unwrap();
        let err = conn
            .execute("UPDATE chunk_records_p0 SET chunk_index = 5 WHERE id = 'c1'", [])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
        // non-identity columns can still change
        conn.execute("UPDATE chunk_records_p0 SET updated_at = 'u' WHERE id = 'c1'", [])
            .unwrap();
    }

    #[test]
    fn audit_log_rejects_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO audit_log (tenant_token, operation, success, request_id, created_at)
             VALUES ('tok', 'query', 1, 'r1', 't')",
            [],
        )
        .unwrap();
        assert!(conn.execute("UPDATE audit_log SET success = 0", []).is_err());
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
