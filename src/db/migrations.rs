//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring the database up to [`CURRENT_SCHEMA_VERSION`].

use rusqlite::Connection;

use super::schema::{get_meta, partition_table, set_meta, stored_partition_count};

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Embedding model recorded for databases created before the key existed.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(get_meta(conn, "schema_version")?
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0))
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    get_meta(conn, "embedding_model")
}

/// Set the stored embedding model identifier.
pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    set_meta(conn, "embedding_model", model)
}

/// Run any pending forward-only migrations. Each migration runs in a transaction.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "running migration");

        let tx = conn.transaction()?;
        match next {
            2 => migrate_v1_to_v2(&tx)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }
        set_meta(&tx, "schema_version", &next.to_string())?;
        tx.commit()?;
        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: expiry indexes for the purge sweep, and the embedding
/// model identifier in `schema_meta`.
fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    let partitions = stored_partition_count(conn)?.unwrap_or(0);
    for partition in 0..partitions {
        let table = partition_table(partition);
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_expires ON {table}(expires_at)
             WHERE expires_at IS NOT NULL;"
        ))?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [DEFAULT_EMBEDDING_MODEL],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn, 2).unwrap();
        conn
    }

    fn index_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn get_schema_version_returns_1_on_fresh_db() {
        let conn = test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn run_migrations_upgrades_to_current() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn migration_v1_to_v2_adds_expiry_indexes_and_model() {
        let mut conn = test_db();
        assert!(get_embedding_model(&conn).unwrap().is_none());
        assert!(!index_exists(&conn, "idx_chunk_records_p0_expires"));

        run_migrations(&mut conn).unwrap();

        assert!(index_exists(&conn, "idx_chunk_records_p0_expires"));
        assert!(index_exists(&conn, "idx_chunk_records_p1_expires"));
        assert_eq!(
            get_embedding_model(&conn).unwrap(),
            Some(DEFAULT_EMBEDDING_MODEL.to_string())
        );
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn set_and_get_embedding_model() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();

        set_embedding_model(&conn, "bge-small-en-v1.5").unwrap();
        assert_eq!(
            get_embedding_model(&conn).unwrap(),
            Some("bge-small-en-v1.5".to_string())
        );
    }
}
