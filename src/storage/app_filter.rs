use crate::config::IsolationMode;
use crate::crypto::TenantToken;
use crate::db::schema::partition_table;

use super::{ChunkBackend, Scope};

/// Reads base tables with an explicit `tenant_token = ?` bound into every
/// statement. For stores without row policies installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplicationFilterBackend;

impl ChunkBackend for ApplicationFilterBackend {
    fn mode(&self) -> IsolationMode {
        IsolationMode::ApplicationFilter
    }

    fn scope<'a>(&self, token: &'a TenantToken, partition: u32) -> Scope<'a> {
        let table = partition_table(partition);
        Scope {
            relation: table.clone(),
            table,
            token_filter: Some(token.as_str()),
        }
    }
}
