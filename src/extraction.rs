//! Extraction stage
//!
//! Deterministic readers that assemble the canonical input context before any
//! generation call. A required source that cannot be read fails the execution
//! with `ExtractionFailed`; optional sources are skipped with a warning.

use crate::capability::GenerationContext;
use crate::error::PipelineError;
use crate::storage::StorageManager;
use crate::types::NaturalKey;
use crate::versioning::VersionManager;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a source may read.
pub struct ExtractionInput<'a> {
    pub natural_key: &'a NaturalKey,
    pub parameters: &'a serde_json::Value,
    pub parent_id: Option<&'a str>,
    pub versions: &'a VersionManager,
    pub storage: &'a StorageManager,
}

#[async_trait]
pub trait ExtractionSource: Send + Sync {
    /// Context key the extracted bytes are stored under.
    fn name(&self) -> &str;

    fn required(&self) -> bool {
        true
    }

    /// `Ok(None)` means the source does not apply to this request.
    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<Option<Vec<u8>>, PipelineError>;
}

/// Output of one extraction run.
#[derive(Debug, Default)]
pub struct Extraction {
    pub context: GenerationContext,
    /// Optional sources that failed, with the reason
    pub skipped: Vec<(String, String)>,
}

impl Extraction {
    pub fn total_bytes(&self) -> usize {
        self.context.values().map(Vec::len).sum()
    }
}

/// Caller-supplied generation parameters, serialized as JSON.
pub struct ParametersSource;

#[async_trait]
impl ExtractionSource for ParametersSource {
    fn name(&self) -> &str {
        "parameters"
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<Option<Vec<u8>>, PipelineError> {
        serde_json::to_vec(input.parameters)
            .map(Some)
            .map_err(|e| PipelineError::ExtractionFailed {
                source_name: self.name().to_string(),
                message: e.to_string(),
            })
    }
}

/// The current document one position earlier in the same owner/kind sequence.
pub struct PredecessorSource {
    required: bool,
}

impl PredecessorSource {
    pub fn new(required: bool) -> Self {
        Self { required }
    }
}

#[async_trait]
impl ExtractionSource for PredecessorSource {
    fn name(&self) -> &str {
        "predecessor"
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<Option<Vec<u8>>, PipelineError> {
        let Some(previous) = input.natural_key.predecessor() else {
            return Ok(None);
        };
        let Some(record) = input.versions.find_current(&previous)? else {
            return Err(PipelineError::ExtractionFailed {
                source_name: self.name().to_string(),
                message: format!("no current document for {}", previous),
            });
        };
        let document = input.storage.load(&record.storage_field).await?;
        let bytes = serde_json::to_vec(&document).map_err(|e| PipelineError::ExtractionFailed {
            source_name: self.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(bytes))
    }
}

/// The document of the record named by the request's `parent_id`.
pub struct ParentSource;

#[async_trait]
impl ExtractionSource for ParentSource {
    fn name(&self) -> &str {
        "parent"
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<Option<Vec<u8>>, PipelineError> {
        let Some(parent_id) = input.parent_id else {
            return Ok(None);
        };
        let record = input.versions.store().get(parent_id)?.ok_or_else(|| {
            PipelineError::ExtractionFailed {
                source_name: self.name().to_string(),
                message: format!("parent record {} does not exist", parent_id),
            }
        })?;
        let field = record.field(crate::store::FIELD_STORAGE).ok_or_else(|| {
            PipelineError::ExtractionFailed {
                source_name: self.name().to_string(),
                message: format!("parent record {} has no stored document", parent_id),
            }
        })?;
        let document = input.storage.load(field).await?;
        let bytes = serde_json::to_vec(&document).map_err(|e| PipelineError::ExtractionFailed {
            source_name: self.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(bytes))
    }
}

pub struct ExtractionStage {
    sources: Vec<Arc<dyn ExtractionSource>>,
}

impl Default for ExtractionStage {
    fn default() -> Self {
        Self::standard(false)
    }
}

impl ExtractionStage {
    pub fn new(sources: Vec<Arc<dyn ExtractionSource>>) -> Self {
        Self { sources }
    }

    /// Parameters, predecessor and parent sources.
    pub fn standard(require_predecessor: bool) -> Self {
        Self::new(vec![
            Arc::new(ParametersSource),
            Arc::new(PredecessorSource::new(require_predecessor)),
            Arc::new(ParentSource),
        ])
    }

    pub fn with_source(mut self, source: Arc<dyn ExtractionSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Run every source in order. Source names must be unique.
    pub async fn run(&self, input: &ExtractionInput<'_>) -> Result<Extraction, PipelineError> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.name()) {
                return Err(PipelineError::StructuralValidation(vec![format!(
                    "extraction source '{}' is registered twice",
                    source.name()
                )]));
            }
        }

        let mut extraction = Extraction::default();
        for source in &self.sources {
            match source.extract(input).await {
                Ok(Some(bytes)) => {
                    debug!(source = source.name(), bytes = bytes.len(), "Source extracted");
                    extraction.context.insert(source.name().to_string(), bytes);
                }
                Ok(None) => {
                    debug!(source = source.name(), "Source not applicable");
                }
                Err(e) if source.required() => {
                    return Err(match e {
                        PipelineError::ExtractionFailed { .. } => e,
                        other => PipelineError::ExtractionFailed {
                            source_name: source.name().to_string(),
                            message: other.to_string(),
                        },
                    });
                }
                Err(e) => {
                    warn!(
                        natural_key = %input.natural_key,
                        source = source.name(),
                        error = %e,
                        "Optional extraction source failed, skipping"
                    );
                    extraction
                        .skipped
                        .push((source.name().to_string(), e.to_string()));
                }
            }
        }
        Ok(extraction)
    }
}
