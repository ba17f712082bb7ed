pub mod migrations;
pub mod policy;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;

use crate::access::{register_session_functions, VaultPool};
use crate::config::{AccessRole, IsolationMode, StorageConfig};
use crate::error::{Error, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// r2d2 manager that opens vault connections with the session functions
/// registered for a fixed [`AccessRole`].
#[derive(Debug, Clone)]
pub struct VaultConnectionManager {
    path: PathBuf,
    role: AccessRole,
    busy_timeout: Duration,
}

impl VaultConnectionManager {
    pub fn new(path: impl Into<PathBuf>, role: AccessRole, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            role,
            busy_timeout,
        }
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        load_sqlite_vec();
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_session_functions(&conn, self.role)?;
        Ok(conn)
    }
}

impl r2d2::ManageConnection for VaultConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> rusqlite::Result<Connection> {
        self.open()
    }

    fn is_valid(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// An initialized vault database: schema, migrations and (in `row_policy`
/// mode) policies in place, plus a connection pool for the configured role.
pub struct Database {
    pool: VaultPool,
    path: PathBuf,
    partitions: u32,
    isolation: IsolationMode,
    role: AccessRole,
    busy_timeout: Duration,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("partitions", &self.partitions)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

/// Open (or create) the vault database described by `config`, with all
/// extensions loaded and schema initialized.
pub fn open_database(config: &StorageConfig, path: impl AsRef<Path>) -> Result<Database> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Storage(format!("failed to create directory {}: {e}", parent.display()))
        })?;
    }

    load_sqlite_vec();
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

    {
        let mut conn = Connection::open(path).map_err(|e| {
            Error::Storage(format!("failed to open database at {}: {e}", path.display()))
        })?;
        conn.busy_timeout(busy_timeout)?;
        // Enable WAL mode for concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        schema::init_schema(&conn, config.partitions)?;
        match schema::stored_partition_count(&conn)? {
            Some(stored) if stored != config.partitions => {
                return Err(Error::Config(format!(
                    "database was created with {stored} partitions but storage.partitions = {}",
                    config.partitions
                )));
            }
            _ => {}
        }
        migrations::run_migrations(&mut conn)?;

        if config.isolation == IsolationMode::RowPolicy {
            policy::install_row_policies(&conn, config.partitions)?;
        }
    }

    let manager = VaultConnectionManager::new(path, config.role, busy_timeout);
    let pool = r2d2::Pool::builder()
        .max_size(config.pool_size)
        .build(manager)?;

    tracing::info!(
        path = %path.display(),
        partitions = config.partitions,
        isolation = config.isolation.as_str(),
        role = config.role.as_str(),
        "database initialized"
    );

    Ok(Database {
        pool,
        path: path.to_path_buf(),
        partitions: config.partitions,
        isolation: config.isolation,
        role: config.role,
        busy_timeout,
    })
}

impl Database {
    pub fn pool(&self) -> &VaultPool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    /// Role of the pooled connections.
    pub fn role(&self) -> AccessRole {
        self.role
    }

    /// A dedicated connection that bypasses row policies, for cross-tenant
    /// sweeps and index rebuilds. Never hand one to tenant traffic.
    pub fn maintenance_connection(&self) -> Result<Connection> {
        let manager =
            VaultConnectionManager::new(&self.path, AccessRole::Maintenance, self.busy_timeout);
        Ok(manager.open()?)
    }

    /// Check that pooled connections are isolated for tenant traffic.
    pub fn verify_isolation(&self) -> Result<()> {
        let conn = self.pool.get()?;
        policy::verify_isolation_preconditions(&conn, self.isolation, self.partitions)
    }

    /// Pin the embedding model the stored vectors were produced with. An empty
    /// database adopts `configured`; a populated one must already match it.
    pub fn bind_embedding_model(&self, configured: &str) -> Result<()> {
        if configured.trim().is_empty() {
            return Err(Error::Config("embedding.model must not be empty".into()));
        }
        let conn = self.maintenance_connection()?;
        let stored = migrations::get_embedding_model(&conn)?;
        if stored.as_deref() == Some(configured) {
            return Ok(());
        }

        let chunks: u64 = self.partition_rows(&conn)?.iter().sum();
        match stored {
            Some(stored) if chunks > 0 => Err(Error::Config(format!(
                "database holds {chunks} chunks embedded with {stored} but embedding.model = {configured}"
            ))),
            previous => {
                migrations::set_embedding_model(&conn, configured)?;
                tracing::info!(model = configured, previous = ?previous, "embedding model recorded");
                Ok(())
            }
        }
    }

    fn partition_rows(&self, conn: &Connection) -> Result<Vec<u64>> {
        let mut rows = Vec::with_capacity(self.partitions as usize);
        for p in 0..self.partitions {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", schema::partition_table(p)),
                [],
                |r| r.get(0),
            )?;
            rows.push(count as u64);
        }
        Ok(rows)
    }

    /// Snapshot used by `doctor`.
    pub fn health(&self) -> Result<HealthReport> {
        let conn = self.maintenance_connection()?;
        let integrity: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
        let schema_version = migrations::get_schema_version(&conn)?;
        let embedding_model = migrations::get_embedding_model(&conn)?;
        let missing_policies = policy::missing_policies(&conn, self.partitions)?;

        let partition_rows = self.partition_rows(&conn)?;
        let audit_rows: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;

        let pooled = self.pool.get()?;
        let pool_bypasses = crate::access::connection_bypasses_policies(&pooled)?;

        Ok(HealthReport {
            integrity_ok: integrity == "ok",
            vec_version,
            schema_version,
            embedding_model,
            isolation: self.isolation,
            missing_policies,
            pool_bypasses,
            partition_rows,
            audit_rows: audit_rows as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub vec_version: String,
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub isolation: IsolationMode,
    pub missing_policies: Vec<String>,
    pub pool_bypasses: bool,
    pub partition_rows: Vec<u64>,
    pub audit_rows: u64,
}

impl HealthReport {
    /// Whether tenant traffic would be isolated.
    pub fn isolation_ok(&self) -> bool {
        !self.pool_bypasses
            && (self.isolation == IsolationMode::ApplicationFilter || self.missing_policies.is_empty())
    }
}
