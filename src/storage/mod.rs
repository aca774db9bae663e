//! Storage manager
//!
//! Turns an aggregate document into the single string stored on its record.
//! Order of preference: inline payload, inline payload of the trimmed document,
//! blob reference to the untrimmed compressed bytes.

pub mod trim;

use crate::blob::BlobStore;
use crate::codec;
use crate::document::AggregateDocument;
use crate::error::PipelineError;
use crate::retry::backoff::{retry_transient, BackoffPolicy};
use crate::types::BlobId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix marking a stored field as a blob reference.
pub const BLOB_REF_PREFIX: &str = "storage:";

/// Value of a record's storage field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredField {
    Inline(String),
    Blob(BlobId),
}

impl StoredField {
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix(BLOB_REF_PREFIX) {
            Some(blob_id) => StoredField::Blob(blob_id.to_string()),
            None => StoredField::Inline(value.to_string()),
        }
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            StoredField::Inline(_) => StorageMode::Inline,
            StoredField::Blob(_) => StorageMode::Blob,
        }
    }

    pub fn blob_id(&self) -> Option<&str> {
        match self {
            StoredField::Blob(id) => Some(id),
            StoredField::Inline(_) => None,
        }
    }
}

impl fmt::Display for StoredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredField::Inline(payload) => f.write_str(payload),
            StoredField::Blob(blob_id) => write!(f, "{}{}", BLOB_REF_PREFIX, blob_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Inline,
    Blob,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Inline => f.write_str("inline"),
            StorageMode::Blob => f.write_str("blob"),
        }
    }
}

/// Result of storing a document.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub field: StoredField,
    /// Encoded size of the untrimmed document.
    pub encoded_len: usize,
    /// Encoded size after trimming, when trimming was attempted.
    pub trimmed_len: Option<usize>,
    /// True when the stored payload is the trimmed document.
    pub trimmed: bool,
}

impl StoreOutcome {
    pub fn mode(&self) -> StorageMode {
        self.field.mode()
    }
}

pub struct StorageManager {
    blobs: Arc<dyn BlobStore>,
    backoff: BackoffPolicy,
}

impl StorageManager {
    pub fn new(blobs: Arc<dyn BlobStore>, backoff: BackoffPolicy) -> Self {
        Self { blobs, backoff }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn store(
        &self,
        doc: &AggregateDocument,
        field_limit: usize,
    ) -> Result<StoreOutcome, PipelineError> {
        let compressed = codec::compress(doc)?;
        let payload = codec::encode(&compressed);
        let encoded_len = payload.len();
        if encoded_len <= field_limit {
            debug!(encoded_len, field_limit, "Storing document inline");
            return Ok(StoreOutcome {
                field: StoredField::Inline(payload),
                encoded_len,
                trimmed_len: None,
                trimmed: false,
            });
        }

        let trimmed_payload = codec::encode(&codec::compress(&trim::trim(doc))?);
        let trimmed_len = trimmed_payload.len();
        if trimmed_len <= field_limit {
            info!(
                encoded_len,
                trimmed_len, field_limit, "Storing trimmed document inline"
            );
            return Ok(StoreOutcome {
                field: StoredField::Inline(trimmed_payload),
                encoded_len,
                trimmed_len: Some(trimmed_len),
                trimmed: true,
            });
        }

        // Upload the untrimmed bytes so nothing is lost
        let blobs = Arc::clone(&self.blobs);
        let blob_id = retry_transient(&self.backoff, "blob_put", || {
            let blobs = Arc::clone(&blobs);
            let bytes = &compressed;
            async move { blobs.put(bytes) }
        })
        .await?;
        info!(
            encoded_len,
            trimmed_len,
            field_limit,
            blob_id = %blob_id,
            "Document exceeds field limit after trimming, stored as blob"
        );
        Ok(StoreOutcome {
            field: StoredField::Blob(blob_id),
            encoded_len,
            trimmed_len: Some(trimmed_len),
            trimmed: false,
        })
    }

    pub async fn load(&self, field: &str) -> Result<AggregateDocument, PipelineError> {
        match StoredField::parse(field) {
            StoredField::Inline(payload) => codec::decompress(&codec::decode(&payload)?),
            StoredField::Blob(blob_id) => {
                let blobs = Arc::clone(&self.blobs);
                let bytes = retry_transient(&self.backoff, "blob_get", || {
                    let blobs = Arc::clone(&blobs);
                    let blob_id = blob_id.clone();
                    async move { blobs.get(&blob_id) }
                })
                .await?
                .ok_or_else(|| {
                    PipelineError::CorruptPayload(format!(
                        "referenced blob {} does not exist",
                        blob_id
                    ))
                })?;
                codec::decompress(&bytes)
            }
        }
    }
}
