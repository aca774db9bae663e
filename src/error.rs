//! Error types for the docforge pipeline.

use crate::critic::CriticResult;
use crate::types::RecordId;
use std::time::Duration;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Pipeline errors, one variant per failure class of the generation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Structural validation failed: {}", .0.join("; "))]
    StructuralValidation(Vec<String>),

    #[error("Extraction failed for source '{source_name}': {message}")]
    ExtractionFailed {
        source_name: String,
        message: String,
    },

    #[error("Stage '{stage}' rejected after {} attempt(s)", .history.len())]
    Rejected {
        stage: String,
        history: Vec<CriticResult>,
    },

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Generation service error: {0}")]
    GenerationService(String),

    #[error("Critique service error: {0}")]
    CritiqueService(String),

    #[error("Service rejected the request: {0}")]
    ServiceRequestInvalid(String),

    #[error("Execution exceeded its wall-clock budget of {0:?}")]
    GenerationTimeout(Duration),

    #[error("Upsert conflict for '{natural_key}': {} current records ({})", .record_ids.len(), .record_ids.join(", "))]
    UpsertConflict {
        natural_key: String,
        record_ids: Vec<RecordId>,
    },

    /// The new record exists but some dependents still name the deleted one.
    /// The replacement stays journaled until `docforge reconcile` finishes it.
    #[error(
        "Replacement of '{natural_key}' incomplete: record {new_record_id} written, {} dependent(s) not re-pointed ({}); run `docforge reconcile`",
        .pending.len(),
        .pending.join(", ")
    )]
    ReplaceIncomplete {
        natural_key: String,
        new_record_id: RecordId,
        pending: Vec<RecordId>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Transient errors are retried with backoff by the caller that hit them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::BlobStore(_)
                | PipelineError::GenerationService(_)
                | PipelineError::CritiqueService(_)
        )
    }

    /// Short machine-readable name, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::StructuralValidation(_) => "structural_validation",
            PipelineError::ExtractionFailed { .. } => "extraction_failed",
            PipelineError::Rejected { .. } => "rejected",
            PipelineError::CorruptPayload(_) => "corrupt_payload",
            PipelineError::BlobStore(_) => "blob_store",
            PipelineError::GenerationService(_) => "generation_service",
            PipelineError::CritiqueService(_) => "critique_service",
            PipelineError::ServiceRequestInvalid(_) => "service_request_invalid",
            PipelineError::GenerationTimeout(_) => "generation_timeout",
            PipelineError::UpsertConflict { .. } => "upsert_conflict",
            PipelineError::ReplaceIncomplete { .. } => "replace_incomplete",
            PipelineError::Storage(_) => "storage",
            PipelineError::ConfigError(_) => "config",
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::ConfigError(err.to_string())
    }
}
