use strongroom::crypto::{chunk_aad, generate_keys, SealedField, TenantCrypto};
use strongroom::config::CryptoConfig;
use strongroom::{DecryptFault, Error, ErrorCode};

fn crypto() -> TenantCrypto {
    let (encryption_key, tenant_secret) = generate_keys();
    TenantCrypto::from_config(&CryptoConfig {
        encryption_key,
        tenant_secret,
    })
    .unwrap()
}

#[test]
fn seal_then_open_round_trips() {
    let crypto = crypto();
    let token = crypto.derive_tenant_token("alice").unwrap();
    let aad = chunk_aad(&token, "chunk-1", SealedField::Text);

    let envelope = crypto.seal(b"invoice #42 due March 1", &aad).unwrap();
    assert_eq!(crypto.open_sealed(&envelope, &aad).unwrap(), b"invoice #42 due March 1");

    // Fresh nonce per call.
    assert_ne!(envelope, crypto.seal(b"invoice #42 due March 1", &aad).unwrap());
}

#[test]
fn envelope_is_bound_to_token_chunk_and_column() {
    let crypto = crypto();
    let alice = crypto.derive_tenant_token("alice").unwrap();
    let bob = crypto.derive_tenant_token("bob").unwrap();
    let envelope = crypto
        .seal(b"secret", &chunk_aad(&alice, "chunk-1", SealedField::Text))
        .unwrap();

    for aad in [
        chunk_aad(&bob, "chunk-1", SealedField::Text),
        chunk_aad(&alice, "chunk-2", SealedField::Text),
        chunk_aad(&alice, "chunk-1", SealedField::Metadata),
        Vec::new(),
    ] {
        let err = crypto.open_sealed(&envelope, &aad).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DecryptionFailure);
    }
}

#[test]
fn every_flipped_bit_is_detected() {
    let crypto = crypto();
    let token = crypto.derive_tenant_token("alice").unwrap();
    let aad = chunk_aad(&token, "chunk-1", SealedField::Vector);
    let envelope = crypto.seal(b"0123456789abcdef", &aad).unwrap();

    for bit in 0..envelope.len() * 8 {
        let mut tampered = envelope.clone();
        tampered[bit / 8] ^= 1 << (bit % 8);
        assert!(
            crypto.open_sealed(&tampered, &aad).is_err(),
            "flip of bit {bit} went undetected"
        );
    }
}

#[test]
fn short_envelopes_and_wrong_keys_fail_the_same_way() {
    let crypto = crypto();
    let token = crypto.derive_tenant_token("alice").unwrap();
    let aad = chunk_aad(&token, "chunk-1", SealedField::Text);
    let envelope = crypto.seal(b"secret", &aad).unwrap();

    let short = crypto.open_sealed(&envelope[..20], &aad).unwrap_err();
    let other_key = self::crypto().open_sealed(&envelope, &aad).unwrap_err();
    assert_eq!(short.code(), ErrorCode::DecryptionFailure);
    assert_eq!(other_key.code(), ErrorCode::DecryptionFailure);
    assert_eq!(short.to_string(), other_key.to_string());

    // Operators still see which check refused.
    assert!(matches!(short, Error::DecryptionFailure(DecryptFault::Truncated)));
    assert!(matches!(other_key, Error::DecryptionFailure(DecryptFault::TagMismatch)));
    assert_ne!(short.audit_detail(), other_key.audit_detail());
}

#[test]
fn tenant_tokens_are_deterministic_and_opaque() {
    let crypto = crypto();
    let a = crypto.derive_tenant_token("alice@example.com").unwrap();
    assert_eq!(a, crypto.derive_tenant_token("alice@example.com").unwrap());
    assert_ne!(a, crypto.derive_tenant_token("bob@example.com").unwrap());
    assert!(!a.as_str().contains("alice"));
    assert_eq!(a.as_str().len(), 64);

    // Another deployment secret yields unrelated tokens.
    let elsewhere = self::crypto().derive_tenant_token("alice@example.com").unwrap();
    assert_ne!(a, elsewhere);
}

#[test]
fn blank_identifiers_are_isolation_violations() {
    let crypto = crypto();
    for id in ["", "   ", "\t\n"] {
        let err = crypto.derive_tenant_token(id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IsolationViolation);
    }
}

#[test]
fn missing_or_short_keys_refuse_to_start() {
    let err = TenantCrypto::from_config(&CryptoConfig::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Misconfigured);
    let err = TenantCrypto::new(&[7u8; 16], &[7u8; 32]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Misconfigured);
    let err = TenantCrypto::new(&[7u8; 32], &[7u8; 8]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Misconfigured);
}
