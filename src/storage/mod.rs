//! Partitioned chunk storage.
//!
//! [`ChunkBackend`] is the seam between the vault and SQLite. Both
//! implementations run every statement on a [`TenantSession`]'s connection; they
//! differ only in where the tenant predicate is evaluated:
//!
//! - [`RowPolicyBackend`] reads the `_visible` views and relies on the policy
//!   triggers for writes.
//! - [`ApplicationFilterBackend`] reads base tables and binds
//!   `tenant_token = ?` into every statement.
//!
//! [`TenantSession`]: crate::access::TenantSession

mod app_filter;
mod row_policy;
pub mod types;

pub use app_filter::ApplicationFilterBackend;
pub use row_policy::RowPolicyBackend;
pub use types::{
    bytes_to_vector, format_timestamp, now_timestamp, partition_for, vector_to_bytes, ChunkRecord,
    NewChunk, SourceKind,
};

use std::collections::HashSet;

use rusqlite::{types::ToSql, Connection};

use crate::config::IsolationMode;
use crate::crypto::TenantToken;
use crate::db::schema::partition_table;
use crate::error::Result;
use types::RECORD_COLUMNS;

/// How a backend scopes statements to a tenant.
pub struct Scope<'a> {
    /// Relation rows are read from (base table or policy view).
    pub relation: String,
    /// Physical table rows are written to.
    pub table: String,
    /// Token bound as `?1` when the backend filters in application code.
    pub token_filter: Option<&'a str>,
}

impl<'a> Scope<'a> {
    fn clause(&self) -> &'static str {
        if self.token_filter.is_some() {
            " AND tenant_token = ?1"
        } else {
            ""
        }
    }

    /// Placeholders already used by the scope.
    fn offset(&self) -> usize {
        usize::from(self.token_filter.is_some())
    }

    fn bind<'p>(&'p self, rest: Vec<&'p dyn ToSql>) -> Vec<&'p dyn ToSql> {
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(rest.len() + 1);
        if let Some(token) = &self.token_filter {
            params.push(token);
        }
        params.extend(rest);
        params
    }
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Storage operations for one tenant's rows within one partition.
///
/// Every method takes the session's connection and the session's token; reads
/// never return rows of another tenant, and expired rows are invisible.
pub trait ChunkBackend: Send + Sync {
    fn mode(&self) -> IsolationMode;

    /// Relation and predicate used for `token` in `partition`.
    fn scope<'a>(&self, token: &'a TenantToken, partition: u32) -> Scope<'a>;

    fn insert(&self, conn: &Connection, token: &TenantToken, partition: u32, chunk: &NewChunk) -> Result<()> {
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let vector = vector_to_bytes(&chunk.plaintext_vector);
        conn.execute(
            &format!(
                "INSERT INTO {} ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
                scope.table
            ),
            rusqlite::params![
                chunk.id,
                token.as_str(),
                chunk.document_id,
                chunk.source_kind.as_str(),
                chunk.chunk_index,
                vector,
                chunk.cipher_text,
                chunk.cipher_metadata,
                chunk.cipher_vector_backup,
                now,
                chunk.expires_at,
            ],
        )?;
        Ok(())
    }

    /// Next free `chunk_index` for a document. Counts expired rows too since
    /// they still hold their slot until purged.
    fn next_chunk_index(&self, conn: &Connection, token: &TenantToken, partition: u32, document_id: &str) -> Result<u32> {
        let scope = self.scope(token, partition);
        let sql = format!(
            "SELECT COALESCE(MAX(chunk_index) + 1, 0) FROM {} WHERE source_document_id = ?{}{}",
            scope.relation,
            scope.offset() + 1,
            scope.clause()
        );
        let params = scope.bind(vec![&document_id]);
        Ok(conn.query_row(&sql, params.as_slice(), |row| row.get(0))?)
    }

    fn fetch_by_ids(&self, conn: &Connection, token: &TenantToken, partition: u32, ids: &[String]) -> Result<Vec<ChunkRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let first = scope.offset() + 1;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE id IN ({}){} \
             AND (expires_at IS NULL OR expires_at > ?{})",
            scope.relation,
            placeholders(first, ids.len()),
            scope.clause(),
            first + ids.len()
        );
        let mut rest: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        rest.push(&now);
        let params = scope.bind(rest);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), ChunkRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Visible chunks of one document, in `chunk_index` order.
    fn fetch_document(&self, conn: &Connection, token: &TenantToken, partition: u32, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let first = scope.offset() + 1;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE source_document_id = ?{first}{} \
             AND (expires_at IS NULL OR expires_at > ?{}) ORDER BY chunk_index",
            scope.relation,
            scope.clause(),
            first + 1
        );
        let params = scope.bind(vec![&document_id, &now]);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), ChunkRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every visible chunk of the tenant in this partition.
    fn fetch_all(&self, conn: &Connection, token: &TenantToken, partition: u32) -> Result<Vec<ChunkRecord>> {
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE (expires_at IS NULL OR expires_at > ?{}){} \
             ORDER BY source_document_id, chunk_index",
            scope.relation,
            scope.offset() + 1,
            scope.clause()
        );
        let params = scope.bind(vec![&now]);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), ChunkRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The subset of `ids` visible to the tenant.
    fn visible_ids(&self, conn: &Connection, token: &TenantToken, partition: u32, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let first = scope.offset() + 1;
        let sql = format!(
            "SELECT id FROM {} WHERE id IN ({}){} AND (expires_at IS NULL OR expires_at > ?{})",
            scope.relation,
            placeholders(first, ids.len()),
            scope.clause(),
            first + ids.len()
        );
        let mut rest: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        rest.push(&now);
        let params = scope.bind(rest);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    /// Delete one chunk. Returns whether a row was removed.
    fn delete(&self, conn: &Connection, token: &TenantToken, partition: u32, chunk_id: &str) -> Result<bool> {
        let scope = self.scope(token, partition);
        let sql = format!(
            "DELETE FROM {} WHERE id = ?{}{}",
            scope.table,
            scope.offset() + 1,
            scope.clause()
        );
        let params = scope.bind(vec![&chunk_id]);
        Ok(conn.execute(&sql, params.as_slice())? > 0)
    }

    /// Exact cosine scan over the tenant's visible rows: `(id, similarity)`,
    /// best first.
    fn exact_neighbors(&self, conn: &Connection, token: &TenantToken, partition: u32, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let blob = vector_to_bytes(query);
        let limit = k as i64;
        let first = scope.offset() + 1;
        let sql = format!(
            "SELECT id, vec_distance_cosine(plaintext_vector, ?{first}) AS distance FROM {} \
             WHERE (expires_at IS NULL OR expires_at > ?{}){} \
             ORDER BY distance ASC, id ASC LIMIT ?{}",
            scope.relation,
            first + 1,
            scope.clause(),
            first + 2
        );
        let params = scope.bind(vec![&blob, &now, &limit]);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            let distance: f64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, 1.0 - distance as f32))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of visible rows for the tenant.
    fn count(&self, conn: &Connection, token: &TenantToken, partition: u32) -> Result<u64> {
        let scope = self.scope(token, partition);
        let now = now_timestamp();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE (expires_at IS NULL OR expires_at > ?{}){}",
            scope.relation,
            scope.offset() + 1,
            scope.clause()
        );
        let params = scope.bind(vec![&now]);
        let count: i64 = conn.query_row(&sql, params.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Backend for the configured isolation mode.
pub fn backend_for(mode: IsolationMode) -> Box<dyn ChunkBackend> {
    match mode {
        IsolationMode::RowPolicy => Box::new(RowPolicyBackend),
        IsolationMode::ApplicationFilter => Box::new(ApplicationFilterBackend),
    }
}

/// Every stored vector in a partition, regardless of tenant or expiry. Needs a
/// maintenance connection under row policies.
pub fn load_partition_vectors(conn: &Connection, partition: u32) -> Result<Vec<(String, Vec<f32>)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, plaintext_vector FROM {} ORDER BY created_at, id",
        partition_table(partition)
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, bytes) = row?;
        out.push((id, bytes_to_vector(&bytes)?));
    }
    Ok(out)
}

/// A row removed by the expiry sweep.
#[derive(Debug, Clone)]
pub struct PurgedChunk {
    pub id: String,
    pub tenant_token: TenantToken,
    pub partition: u32,
}

/// Delete every expired row in a partition across tenants. Needs a
/// maintenance connection under row policies.
pub fn purge_expired_rows(conn: &Connection, partition: u32, now: &str) -> Result<Vec<PurgedChunk>> {
    let mut stmt = conn.prepare(&format!(
        "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?1 RETURNING id, tenant_token",
        partition_table(partition)
    ))?;
    let rows = stmt.query_map([now], |row| {
        Ok(PurgedChunk {
            id: row.get(0)?,
            tenant_token: TenantToken::from_stored(row.get(1)?),
            partition,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
