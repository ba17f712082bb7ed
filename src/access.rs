//! Per-request tenant sessions.
//!
//! Row visibility is evaluated by SQLite itself: the views and triggers in
//! [`crate::db::policy`] compare each row's `tenant_token` against
//! `current_tenant_context()`, a connection-scoped function registered here.
//! A [`TenantSession`] checks a connection out of the pool, pins the context
//! with a bound parameter, and clears it again when dropped.

use std::sync::{Arc, Mutex};

use r2d2::{Pool, PooledConnection};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Transaction};

use crate::config::AccessRole;
use crate::crypto::TenantToken;
use crate::db::VaultConnectionManager;
use crate::error::{Error, Result};

pub type VaultPool = Pool<VaultConnectionManager>;

/// Register `set_tenant_context`, `current_tenant_context` and
/// `tenant_policy_bypass` on a fresh connection.
///
/// `set_tenant_context` is direct-only so no view or trigger can change the
/// context. The bypass flag is fixed for the life of the connection.
pub(crate) fn register_session_functions(conn: &Connection, role: AccessRole) -> rusqlite::Result<()> {
    let context: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let setter = Arc::clone(&context);
    conn.create_scalar_function(
        "set_tenant_context",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let value = ctx.get::<Option<String>>(0)?;
            let mut slot = setter
                .lock()
                .map_err(|_| rusqlite::Error::UserFunctionError("tenant context poisoned".into()))?;
            *slot = value.filter(|v| !v.is_empty());
            Ok(slot.is_some())
        },
    )?;

    let getter = Arc::clone(&context);
    conn.create_scalar_function(
        "current_tenant_context",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |_ctx| {
            let slot = getter
                .lock()
                .map_err(|_| rusqlite::Error::UserFunctionError("tenant context poisoned".into()))?;
            Ok(slot.clone())
        },
    )?;

    let bypass = role.bypasses_row_policies();
    conn.create_scalar_function(
        "tenant_policy_bypass",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS,
        move |_ctx| Ok(bypass),
    )?;

    Ok(())
}

/// Whether the connection bypasses row policies, as reported by the store.
pub fn connection_bypasses_policies(conn: &Connection) -> Result<bool> {
    Ok(conn.query_row("SELECT tenant_policy_bypass()", [], |row| row.get::<_, bool>(0))?)
}

/// A pooled connection pinned to one tenant for the duration of a request.
pub struct TenantSession {
    conn: PooledConnection<VaultConnectionManager>,
    token: Option<TenantToken>,
}

impl TenantSession {
    /// Check out a connection and pin `token` as its tenant context.
    pub fn begin(pool: &VaultPool, token: &TenantToken) -> Result<Self> {
        let conn = pool.get()?;
        let pinned: bool = conn.query_row(
            "SELECT set_tenant_context(?1)",
            [token.as_str()],
            |row| row.get(0),
        )?;
        if !pinned {
            return Err(Error::IsolationViolation("tenant context was not set".into()));
        }
        tracing::trace!(tenant = token.short(), "tenant session started");
        Ok(Self {
            conn,
            token: Some(token.clone()),
        })
    }

    /// A session with no tenant context. Sees no tenant rows; used to audit
    /// attempts that never resolved a tenant.
    pub fn unscoped(pool: &VaultPool) -> Result<Self> {
        let conn = pool.get()?;
        conn.query_row("SELECT set_tenant_context(NULL)", [], |_| Ok(()))?;
        Ok(Self { conn, token: None })
    }

    /// The pinned tenant. Errors for unscoped sessions.
    pub fn token(&self) -> Result<&TenantToken> {
        self.token
            .as_ref()
            .ok_or_else(|| Error::IsolationViolation("no tenant context on session".into()))
    }

    /// Token as stored in audit rows: empty for unscoped sessions.
    pub fn audit_token(&self) -> &str {
        self.token.as_ref().map(TenantToken::as_str).unwrap_or("")
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        if let Err(e) = self
            .conn
            .query_row("SELECT set_tenant_context(NULL)", [], |_| Ok(()))
        {
            tracing::warn!(error = %e, "failed to clear tenant context");
        }
    }
}
