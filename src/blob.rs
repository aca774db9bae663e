//! Blob storage
//!
//! Content-addressed storage for payloads that do not fit inline. Blob ids are
//! the first 20 hex characters of the BLAKE3 hash of the bytes, so putting the
//! same payload twice is a no-op that returns the same id.

use crate::error::PipelineError;
use crate::types::{BlobId, BLOB_ID_LEN};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Object store interface used by the storage manager and reconciler.
pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<BlobId, PipelineError>;
    fn get(&self, blob_id: &str) -> Result<Option<Vec<u8>>, PipelineError>;
    fn delete(&self, blob_id: &str) -> Result<(), PipelineError>;
    fn list(&self) -> Result<Vec<BlobId>, PipelineError>;
}

/// Compute the blob id for a payload.
pub fn compute_blob_id(bytes: &[u8]) -> BlobId {
    let hash = blake3::hash(bytes);
    hex::encode(&hash.as_bytes()[..BLOB_ID_LEN / 2])
}

/// Check that a blob id has the shape produced by [`compute_blob_id`].
pub fn is_valid_blob_id(blob_id: &str) -> bool {
    blob_id.len() == BLOB_ID_LEN
        && blob_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn check_blob_id(blob_id: &str) -> Result<(), PipelineError> {
    if is_valid_blob_id(blob_id) {
        Ok(())
    } else {
        Err(PipelineError::CorruptPayload(format!(
            "invalid blob id '{}'",
            blob_id
        )))
    }
}

/// Filesystem blob store
///
/// Layout: `{root}/blobs/{id[0..2]}/{id}.blob`. Writes go to a `.tmp` file that
/// is renamed into place, so readers never observe a partial blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, PipelineError> {
        let root = root.as_ref().to_path_buf();
        let blobs_dir = root.join("blobs");
        fs::create_dir_all(&blobs_dir).map_err(|e| {
            PipelineError::BlobStore(format!(
                "Failed to create blobs directory at {:?}: {}",
                blobs_dir, e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.root
            .join("blobs")
            .join(&blob_id[0..2])
            .join(format!("{}.blob", blob_id))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobId, PipelineError> {
        let blob_id = compute_blob_id(bytes);
        let blob_path = self.blob_path(&blob_id);
        if blob_path.exists() {
            return Ok(blob_id);
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::BlobStore(format!(
                    "Failed to create parent directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let temp_path = blob_path.with_extension("blob.tmp");
        fs::write(&temp_path, bytes).map_err(|e| {
            PipelineError::BlobStore(format!("Failed to write blob to {:?}: {}", temp_path, e))
        })?;
        fs::rename(&temp_path, &blob_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            PipelineError::BlobStore(format!(
                "Failed to rename temp file to {:?}: {}",
                blob_path, e
            ))
        })?;

        Ok(blob_id)
    }

    fn get(&self, blob_id: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        check_blob_id(blob_id)?;
        let blob_path = self.blob_path(blob_id);
        if !blob_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&blob_path).map_err(|e| {
            PipelineError::BlobStore(format!("Failed to read blob from {:?}: {}", blob_path, e))
        })?;
        if compute_blob_id(&bytes) != blob_id {
            return Err(PipelineError::CorruptPayload(format!(
                "blob {} does not match its content hash",
                blob_id
            )));
        }
        Ok(Some(bytes))
    }

    fn delete(&self, blob_id: &str) -> Result<(), PipelineError> {
        check_blob_id(blob_id)?;
        let blob_path = self.blob_path(blob_id);
        match fs::remove_file(&blob_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::BlobStore(format!(
                "Failed to delete blob {:?}: {}",
                blob_path, e
            ))),
        }
    }

    fn list(&self) -> Result<Vec<BlobId>, PipelineError> {
        let blobs_dir = self.root.join("blobs");
        let mut ids = Vec::new();
        let shards = fs::read_dir(&blobs_dir).map_err(|e| {
            PipelineError::BlobStore(format!("Failed to list {:?}: {}", blobs_dir, e))
        })?;
        for shard in shards {
            let shard = shard.map_err(|e| PipelineError::BlobStore(e.to_string()))?;
            if !shard.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(shard.path())
                .map_err(|e| PipelineError::BlobStore(e.to_string()))?;
            for entry in entries {
                let path = entry
                    .map_err(|e| PipelineError::BlobStore(e.to_string()))?
                    .path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("blob") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if is_valid_blob_id(stem) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory blob store for tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<BlobId, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobId, PipelineError> {
        let blob_id = compute_blob_id(bytes);
        self.blobs
            .write()
            .entry(blob_id.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(blob_id)
    }

    fn get(&self, blob_id: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        check_blob_id(blob_id)?;
        Ok(self.blobs.read().get(blob_id).cloned())
    }

    fn delete(&self, blob_id: &str) -> Result<(), PipelineError> {
        check_blob_id(blob_id)?;
        self.blobs.write().remove(blob_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<BlobId>, PipelineError> {
        Ok(self.blobs.read().keys().cloned().collect())
    }
}
