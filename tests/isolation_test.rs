mod helpers;

use helpers::{index_text, open_vault, query, test_vector};
use strongroom::access::TenantSession;
use strongroom::config::{AccessRole, IsolationMode};
use strongroom::db::policy::visible_view;
use strongroom::storage::{backend_for, partition_for, NewChunk, SourceKind};
use strongroom::{ErrorCode, MemoryVault};

fn visible_rows(conn: &rusqlite::Connection, partitions: u32) -> i64 {
    (0..partitions)
        .map(|p| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", visible_view(p)), [], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap()
        })
        .sum()
}

#[tokio::test]
async fn sessions_see_only_their_tenant_in_both_modes() {
    for mode in [IsolationMode::RowPolicy, IsolationMode::ApplicationFilter] {
        let t = open_vault(mode);
        index_text(&t.vault, "alice", "doc", "alice only", test_vector(1)).await;

        let db = t.vault.database();
        let backend = backend_for(mode);
        let alice = t.vault.tenant_token("alice").unwrap();
        let bob = t.vault.tenant_token("bob").unwrap();

        let session = TenantSession::begin(db.pool(), &alice).unwrap();
        let p = partition_for(&alice, db.partitions());
        assert_eq!(backend.count(session.conn(), &alice, p).unwrap(), 1, "{mode:?}");
        drop(session);

        let session = TenantSession::begin(db.pool(), &bob).unwrap();
        for p in 0..db.partitions() {
            assert_eq!(backend.count(session.conn(), &bob, p).unwrap(), 0, "{mode:?}");
        }
    }
}

#[tokio::test]
async fn unset_context_sees_nothing() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "one", test_vector(1)).await;
    index_text(&t.vault, "bob", "doc", "two", test_vector(2)).await;

    let db = t.vault.database();
    let session = TenantSession::unscoped(db.pool()).unwrap();
    assert_eq!(visible_rows(session.conn(), db.partitions()), 0);
    assert!(session.token().is_err());
}

#[tokio::test]
async fn context_is_cleared_when_session_ends() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "one", test_vector(1)).await;

    let db = t.vault.database();
    let alice = t.vault.tenant_token("alice").unwrap();
    drop(TenantSession::begin(db.pool(), &alice).unwrap());

    // Every pooled connection comes back without a tenant.
    let conns: Vec<_> = (0..t.config.storage.pool_size)
        .map(|_| db.pool().get().unwrap())
        .collect();
    for conn in &conns {
        let context: Option<String> = conn
            .query_row("SELECT current_tenant_context()", [], |r| r.get(0))
            .unwrap();
        assert!(context.is_none());
        assert_eq!(visible_rows(conn, db.partitions()), 0);
    }
}

#[tokio::test]
async fn store_rejects_rows_for_another_tenant() {
    let t = open_vault(IsolationMode::RowPolicy);
    let db = t.vault.database();
    let alice = t.vault.tenant_token("alice").unwrap();
    let bob = t.vault.tenant_token("bob").unwrap();

    let session = TenantSession::begin(db.pool(), &alice).unwrap();
    let chunk = NewChunk {
        id: "forged".into(),
        document_id: "doc".into(),
        source_kind: SourceKind::Api,
        chunk_index: 0,
        plaintext_vector: test_vector(1),
        cipher_text: vec![0; 40],
        cipher_metadata: None,
        cipher_vector_backup: vec![0; 40],
        expires_at: None,
    };
    let err = backend_for(IsolationMode::RowPolicy)
        .insert(session.conn(), &bob, partition_for(&bob, db.partitions()), &chunk)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IsolationViolation);
}

#[tokio::test]
async fn maintenance_role_sees_every_tenant_and_cannot_serve_traffic() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "one", test_vector(1)).await;
    index_text(&t.vault, "bob", "doc", "two", test_vector(2)).await;

    let maintenance = t.maintenance();
    assert_eq!(visible_rows(&maintenance, t.config.storage.partitions), 2);

    let mut config = t.config.clone();
    config.storage.role = AccessRole::Maintenance;
    let err = MemoryVault::open(&config, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IsolationViolation);
}

#[tokio::test]
async fn swapped_ciphertext_fails_closed() {
    let t = open_vault(IsolationMode::RowPolicy);
    let a = index_text(&t.vault, "alice", "doc", "first secret", test_vector(1)).await;
    let b = index_text(&t.vault, "alice", "doc", "second secret", test_vector(2)).await;

    // Move b's envelope into a's row: same tenant, wrong chunk id in the AAD.
    let table = t.table_for("alice");
    let conn = t.maintenance();
    conn.execute(
        &format!(
            "UPDATE {table} SET cipher_text = (SELECT cipher_text FROM {table} WHERE id = ?2) WHERE id = ?1"
        ),
        [&a.chunk_id, &b.chunk_id],
    )
    .unwrap();

    let err = t
        .vault
        .query(helpers::query_request("alice", test_vector(1), 2))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DecryptionFailure);
    assert_eq!(err.body().message, "access denied");

    let err = t.vault.summarize("alice", "doc").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DecryptionFailure);

    // The failure is audited against the chunk that failed.
    let trail = t.vault.audit_trail("alice", 20).await.unwrap();
    let failure = trail
        .records
        .iter()
        .find(|r| r.error_code.as_deref() == Some("decryption_failure"))
        .unwrap();
    assert_eq!(failure.chunk_id.as_deref(), Some(a.chunk_id.as_str()));
    let detail = failure.detail.as_deref().unwrap_or_default();
    assert_eq!(detail, "decryption failure: authentication tag mismatch");
    assert!(!detail.contains("secret"));
}

#[tokio::test]
async fn ciphertext_copied_across_tenants_does_not_open() {
    let t = open_vault(IsolationMode::ApplicationFilter);
    let alice = index_text(&t.vault, "alice", "doc", "alice's words", test_vector(1)).await;
    let bob = index_text(&t.vault, "bob", "doc", "bob's words", test_vector(1)).await;

    let conn = t.maintenance();
    let stolen: Vec<u8> = conn
        .query_row(
            &format!("SELECT cipher_text FROM {} WHERE id = ?1", t.table_for("alice")),
            [&alice.chunk_id],
            |r| r.get(0),
        )
        .unwrap();
    conn.execute(
        &format!("UPDATE {} SET cipher_text = ?1 WHERE id = ?2", t.table_for("bob")),
        rusqlite::params![stolen, bob.chunk_id],
    )
    .unwrap();

    let err = t.vault.summarize("bob", "doc").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DecryptionFailure);
    // Alice is unaffected.
    assert_eq!(query(&t.vault, "alice", test_vector(1), 1).await.results.len(), 1);
}
