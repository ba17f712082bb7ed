//! Append-only audit trail.
//!
//! One row per access attempt, successful or not. Rows are written on the
//! request's own tenant session, so under row policies the insert is accepted
//! only for the session's tenant (or the empty token for unscoped attempts).

use rusqlite::Connection;
use serde::Serialize;

use crate::config::IsolationMode;
use crate::crypto::TenantToken;
use crate::error::{ErrorCode, Result};
use crate::storage::now_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Index,
    Query,
    Summarize,
    Entities,
    Delete,
    Audit,
    Verify,
    Purge,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Query => "query",
            Self::Summarize => "summarize",
            Self::Entities => "entities",
            Self::Delete => "delete",
            Self::Audit => "audit",
            Self::Verify => "verify",
            Self::Purge => "purge",
        }
    }
}

impl std::str::FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "index" => Self::Index,
            "query" => Self::Query,
            "summarize" => Self::Summarize,
            "entities" => Self::Entities,
            "delete" => Self::Delete,
            "audit" => Self::Audit,
            "verify" => Self::Verify,
            "purge" => Self::Purge,
            other => return Err(format!("unknown audit operation: {other}")),
        })
    }
}

/// An access attempt to record.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    /// Empty for attempts that never resolved a tenant.
    pub tenant_token: &'a str,
    pub chunk_id: Option<&'a str>,
    pub operation: AuditOperation,
    pub request_id: &'a str,
    pub error_code: Option<ErrorCode>,
    /// Internal failure detail. Never plaintext payloads.
    pub detail: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    pub fn success(tenant_token: &'a str, operation: AuditOperation, request_id: &'a str) -> Self {
        Self {
            tenant_token,
            chunk_id: None,
            operation,
            request_id,
            error_code: None,
            detail: None,
        }
    }

    pub fn failure(
        tenant_token: &'a str,
        operation: AuditOperation,
        request_id: &'a str,
        code: ErrorCode,
        detail: &'a str,
    ) -> Self {
        Self {
            tenant_token,
            chunk_id: None,
            operation,
            request_id,
            error_code: Some(code),
            detail: Some(detail),
        }
    }

    pub fn with_chunk(mut self, chunk_id: &'a str) -> Self {
        self.chunk_id = Some(chunk_id);
        self
    }
}

/// An audit row as read back.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub chunk_id: Option<String>,
    pub operation: String,
    pub success: bool,
    pub error_code: Option<String>,
    pub request_id: String,
    pub detail: Option<String>,
    pub created_at: String,
}

pub fn record(conn: &Connection, event: &AuditEvent<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (tenant_token, chunk_id, operation, success, error_code, request_id, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.tenant_token,
            event.chunk_id,
            event.operation.as_str(),
            event.error_code.is_none(),
            event.error_code.map(|c| c.as_str()),
            event.request_id,
            event.detail,
            now_timestamp(),
        ],
    )?;
    Ok(())
}

/// The tenant's audit rows, newest first.
pub fn list_for_tenant(
    conn: &Connection,
    mode: IsolationMode,
    token: &TenantToken,
    limit: usize,
) -> Result<Vec<AuditRecord>> {
    const COLUMNS: &str = "id, chunk_id, operation, success, error_code, request_id, detail, created_at";
    let limit = limit as i64;
    let token = token.as_str();
    let (sql, params): (String, Vec<&dyn rusqlite::ToSql>) = match mode {
        IsolationMode::RowPolicy => (
            format!("SELECT {COLUMNS} FROM audit_log_visible ORDER BY id DESC LIMIT ?1"),
            vec![&limit],
        ),
        IsolationMode::ApplicationFilter => (
            format!("SELECT {COLUMNS} FROM audit_log WHERE tenant_token = ?1 ORDER BY id DESC LIMIT ?2"),
            vec![&token, &limit],
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| {
        Ok(AuditRecord {
            id: row.get(0)?,
            chunk_id: row.get(1)?,
            operation: row.get(2)?,
            success: row.get(3)?,
            error_code: row.get(4)?,
            request_id: row.get(5)?,
            detail: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
