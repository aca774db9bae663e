//! docforge: quality-gated document generation
//!
//! Turns a generation request, identified by a natural key, into a durably
//! stored and versioned structured document. Generation and critique are
//! external capabilities; this crate is the control system around them:
//! bounded critic-driven retries, cross-entry validation, a size-limited
//! inline codec with blob fallback, and idempotent versioned upserts.

pub mod assembly;
pub mod blob;
pub mod capability;
pub mod cli;
pub mod codec;
pub mod config;
pub mod critic;
pub mod document;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod storage;
pub mod store;
pub mod types;
pub mod versioning;
pub mod workspace;

pub use error::{PipelineError, StorageError};
pub use pipeline::{
    BatchOutcome, ExecutionFailure, Pipeline, PipelineRequest, PipelineResponse, PipelineSettings,
};
pub use types::{DocVersion, NaturalKey, RecordStatus};
