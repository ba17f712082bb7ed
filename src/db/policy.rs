//! Store-evaluated row policies.
//!
//! Every partition gets one policy per operation:
//!
//! | operation | object | effect on a foreign row |
//! |-----------|--------|--------------------------|
//! | read | view `chunk_records_p{n}_visible` | filtered out |
//! | insert | `BEFORE INSERT` trigger | statement aborts |
//! | update | `BEFORE UPDATE` trigger | skipped; mismatching new token aborts |
//! | delete | `BEFORE DELETE` trigger | skipped |
//!
//! The audit log gets a read view and an insert check. Connections opened with
//! [`AccessRole::Maintenance`] see every row because `tenant_policy_bypass()`
//! returns true for them.

use rusqlite::Connection;

use super::schema::{get_meta, partition_table, set_meta};
use crate::access::connection_bypasses_policies;
use crate::config::IsolationMode;
use crate::error::{Error, Result, POLICY_VIOLATION_MESSAGE};

/// Row visibility predicate, parameterized on the row alias.
fn visible(row: &str) -> String {
    format!("({row}.tenant_token = coalesce(current_tenant_context(), '') OR tenant_policy_bypass())")
}

/// Name of the read-policy view for a partition.
pub fn visible_view(partition: u32) -> String {
    format!("{}_visible", partition_table(partition))
}

fn partition_policy_sql(partition: u32) -> String {
    let table = partition_table(partition);
    let view = visible_view(partition);
    let row = visible(&table);
    let old = visible("OLD");
    let new = visible("NEW");
    format!(
        r#"
CREATE VIEW IF NOT EXISTS {view} AS
    SELECT * FROM {table} WHERE {row};

CREATE TRIGGER IF NOT EXISTS {table}_policy_insert BEFORE INSERT ON {table}
WHEN NOT {new}
BEGIN
    SELECT RAISE(ABORT, '{POLICY_VIOLATION_MESSAGE}');
END;

CREATE TRIGGER IF NOT EXISTS {table}_policy_update BEFORE UPDATE ON {table}
BEGIN
    SELECT RAISE(IGNORE) WHERE NOT {old};
    SELECT RAISE(ABORT, '{POLICY_VIOLATION_MESSAGE}') WHERE NOT {new};
END;

CREATE TRIGGER IF NOT EXISTS {table}_policy_delete BEFORE DELETE ON {table}
WHEN NOT {old}
BEGIN
    SELECT RAISE(IGNORE);
END;
"#
    )
}

fn audit_policy_sql() -> String {
    let row = visible("audit_log");
    let new = visible("NEW");
    format!(
        r#"
CREATE VIEW IF NOT EXISTS audit_log_visible AS
    SELECT * FROM audit_log WHERE {row};

CREATE TRIGGER IF NOT EXISTS audit_log_policy_insert BEFORE INSERT ON audit_log
WHEN NOT {new}
BEGIN
    SELECT RAISE(ABORT, '{POLICY_VIOLATION_MESSAGE}');
END;
"#
    )
}

/// Policy objects expected in `sqlite_master` for `partitions` partitions.
fn expected_objects(partitions: u32) -> Vec<String> {
    let mut names = vec![
        "audit_log_visible".to_string(),
        "audit_log_policy_insert".to_string(),
    ];
    for p in 0..partitions {
        let table = partition_table(p);
        names.push(visible_view(p));
        names.push(format!("{table}_policy_insert"));
        names.push(format!("{table}_policy_update"));
        names.push(format!("{table}_policy_delete"));
    }
    names
}

/// Install every policy. Idempotent.
pub fn install_row_policies(conn: &Connection, partitions: u32) -> rusqlite::Result<()> {
    for partition in 0..partitions {
        conn.execute_batch(&partition_policy_sql(partition))?;
    }
    conn.execute_batch(&audit_policy_sql())?;
    set_meta(conn, "row_policies", "installed")?;
    tracing::debug!(partitions, "row policies installed");
    Ok(())
}

/// Names of expected policy objects that are missing.
pub fn missing_policies(conn: &Connection, partitions: u32) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('view', 'trigger') AND name = ?1",
    )?;
    let mut missing = Vec::new();
    for name in expected_objects(partitions) {
        let count: i64 = stmt.query_row([&name], |row| row.get(0))?;
        if count == 0 {
            missing.push(name);
        }
    }
    Ok(missing)
}

pub fn policies_recorded(conn: &Connection) -> rusqlite::Result<bool> {
    Ok(get_meta(conn, "row_policies")?.as_deref() == Some("installed"))
}

/// Refuse to serve tenant traffic on a connection that would not be isolated.
///
/// Fails when the connection bypasses row policies, or when `mode` relies on
/// store-evaluated policies that are not installed.
pub fn verify_isolation_preconditions(
    conn: &Connection,
    mode: IsolationMode,
    partitions: u32,
) -> Result<()> {
    if connection_bypasses_policies(conn)? {
        return Err(Error::IsolationViolation(
            "connection role bypasses row policies; refusing tenant traffic".into(),
        ));
    }
    if mode == IsolationMode::RowPolicy {
        let missing = missing_policies(conn, partitions)?;
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "row_policy isolation selected but policies are missing: {}",
                missing.join(", ")
            )));
        }
    }
    Ok(())
}
