use crate::config::IsolationMode;
use crate::crypto::TenantToken;
use crate::db::policy::visible_view;
use crate::db::schema::partition_table;

use super::{ChunkBackend, Scope};

/// Reads through the policy views; SQLite evaluates the tenant predicate.
///
/// Statements carry no tenant filter of their own, so a connection without a
/// pinned context sees nothing and inserts for a foreign token abort.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowPolicyBackend;

impl ChunkBackend for RowPolicyBackend {
    fn mode(&self) -> IsolationMode {
        IsolationMode::RowPolicy
    }

    fn scope<'a>(&self, _token: &'a TenantToken, partition: u32) -> Scope<'a> {
        Scope {
            relation: visible_view(partition),
            table: partition_table(partition),
            token_filter: None,
        }
    }
}
