//! Tenant crypto layer.
//!
//! Two primitives carry tenant isolation independently of the store:
//!
//! - [`TenantCrypto::derive_tenant_token`] turns a caller-supplied user id into an
//!   opaque, deterministic HMAC-SHA256 token. Raw user ids are never persisted.
//! - [`TenantCrypto::seal`] / [`TenantCrypto::open_sealed`] wrap payloads in
//!   AES-256-GCM envelopes (`nonce || ciphertext || tag`) whose associated data
//!   binds them to a tenant, a chunk and a column.
//!
//! Any failure to open an envelope collapses into [`Error::DecryptionFailure`]
//! so callers cannot distinguish a short envelope from a wrong key. The
//! [`DecryptFault`] it carries only reaches the audit trail.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::CryptoConfig;
use crate::error::{DecryptFault, Error, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Minimum tenant secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const TOKEN_DOMAIN: &[u8] = b"strongroom.tenant-token.v1";

type HmacSha256 = Hmac<Sha256>;

/// Opaque, HMAC-derived tenant identifier (lowercase hex).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TenantToken(String);

impl TenantToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// Rehydrate a token read back from storage.
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for TenantToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TenantToken({}…)", self.short())
    }
}

impl std::fmt::Display for TenantToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which encrypted column an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedField {
    Text,
    Metadata,
    Vector,
}

impl SealedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Metadata => "metadata",
            Self::Vector => "vector",
        }
    }
}

/// Build associated data binding an envelope to `(token, chunk_id, field)`.
///
/// Each component is length-prefixed so no two distinct triples encode to the
/// same byte string.
pub fn chunk_aad(token: &TenantToken, chunk_id: &str, field: SealedField) -> Vec<u8> {
    let parts: [&[u8]; 3] = [
        token.as_str().as_bytes(),
        chunk_id.as_bytes(),
        field.as_str().as_bytes(),
    ];
    let mut aad = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
        aad.extend_from_slice(part);
    }
    aad
}

/// Server-held key material: the data encryption key and the token secret.
pub struct TenantCrypto {
    cipher: Aes256Gcm,
    token_secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for TenantCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCrypto").finish_non_exhaustive()
    }
}

impl TenantCrypto {
    pub fn new(encryption_key: &[u8], token_secret: &[u8]) -> Result<Self> {
        if encryption_key.len() != KEY_LEN {
            return Err(Error::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                encryption_key.len()
            )));
        }
        if token_secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "tenant secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                token_secret.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(encryption_key)
            .map_err(|_| Error::Config("invalid encryption key".into()))?;
        Ok(Self {
            cipher,
            token_secret: Zeroizing::new(token_secret.to_vec()),
        })
    }

    /// Build from base64 key material in config.
    pub fn from_config(config: &CryptoConfig) -> Result<Self> {
        let key = decode_key("crypto.encryption_key", &config.encryption_key)?;
        let secret = decode_key("crypto.tenant_secret", &config.tenant_secret)?;
        Self::new(&key, &secret)
    }

    /// Deterministically derive the tenant token for a user identifier.
    pub fn derive_tenant_token(&self, user_identifier: &str) -> Result<TenantToken> {
        if user_identifier.trim().is_empty() {
            return Err(Error::IsolationViolation(
                "tenant identifier must not be empty".into(),
            ));
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.token_secret)
            .map_err(|_| Error::Config("invalid tenant secret".into()))?;
        mac.update(TOKEN_DOMAIN);
        mac.update(&[0u8]);
        mac.update(user_identifier.as_bytes());
        Ok(TenantToken(hex::encode(mac.finalize().into_bytes())))
    }

    /// Encrypt `plaintext` with a fresh random nonce. Returns `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| Error::Storage("encryption failed".into()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Decrypt an envelope. Succeeds only with exactly the associated data used
    /// at seal time.
    pub fn open_sealed(&self, envelope: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::DecryptionFailure(DecryptFault::Truncated));
        }
        let (nonce_bytes, sealed) = envelope.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: associated_data,
                },
            )
            .map_err(|_| Error::DecryptionFailure(DecryptFault::TagMismatch))
    }
}

fn decode_key(name: &str, value: &str) -> Result<Zeroizing<Vec<u8>>> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} is not set")));
    }
    BASE64
        .decode(value.trim())
        .map(Zeroizing::new)
        .map_err(|e| Error::Config(format!("{name} is not valid base64: {e}")))
}

/// Fresh random key material, base64 encoded: `(encryption_key, tenant_secret)`.
pub fn generate_keys() -> (String, String) {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    let mut secret = Zeroizing::new([0u8; MIN_SECRET_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    OsRng.fill_bytes(&mut secret[..]);
    (BASE64.encode(&key[..]), BASE64.encode(&secret[..]))
}
