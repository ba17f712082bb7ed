use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::TenantToken;
use crate::error::{Error, Result};

/// Where a chunk's source document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Api,
    Message,
    Import,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Api => "api",
            Self::Message => "message",
            Self::Import => "import",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "api" => Ok(Self::Api),
            "message" => Ok(Self::Message),
            "import" => Ok(Self::Import),
            _ => Err(Error::Validation(format!("unknown source kind: {s}"))),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully sealed chunk ready to be written.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: String,
    pub document_id: String,
    pub source_kind: SourceKind,
    pub chunk_index: u32,
    pub plaintext_vector: Vec<f32>,
    pub cipher_text: Vec<u8>,
    pub cipher_metadata: Option<Vec<u8>>,
    pub cipher_vector_backup: Vec<u8>,
    pub expires_at: Option<String>,
}

/// A chunk row as read back from a partition. Payload columns are still sealed.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub tenant_token: TenantToken,
    pub document_id: String,
    pub source_kind: SourceKind,
    pub chunk_index: u32,
    pub plaintext_vector: Vec<f32>,
    pub cipher_text: Vec<u8>,
    pub cipher_metadata: Option<Vec<u8>>,
    pub cipher_vector_backup: Vec<u8>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
}

/// Columns selected for a [`ChunkRecord`], in `from_row` order.
pub(crate) const RECORD_COLUMNS: &str = "id, tenant_token, source_document_id, source_kind, \
     chunk_index, plaintext_vector, cipher_text, cipher_metadata, cipher_vector_backup, \
     created_at, updated_at, expires_at";

impl ChunkRecord {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(3)?;
        let vector: Vec<u8> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            tenant_token: TenantToken::from_stored(row.get(1)?),
            document_id: row.get(2)?,
            source_kind: kind.parse().map_err(|e: Error| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
            })?,
            chunk_index: row.get(4)?,
            plaintext_vector: bytes_to_vector(&vector).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Blob, e.into())
            })?,
            cipher_text: row.get(6)?,
            cipher_metadata: row.get(7)?,
            cipher_vector_backup: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            expires_at: row.get(11)?,
        })
    }
}

/// Partition for a tenant: first four bytes (big endian) of SHA-256(token), mod `partitions`.
pub fn partition_for(token: &TenantToken, partitions: u32) -> u32 {
    let digest = Sha256::digest(token.as_str().as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partitions.max(1)
}

/// Encode a vector as little-endian f32 bytes (the sqlite-vec float32 blob format).
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Validation(format!(
            "vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Current time as RFC 3339 UTC with fixed millisecond precision.
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
