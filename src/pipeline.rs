//! Pipeline orchestration
//!
//! One execution runs Extraction, then every stage through the retry
//! controller, then Assembly, Storage and Upsert, sequentially. Each stage is
//! timed into the execution's metrics. Batches run executions concurrently and
//! collect per-item outcomes.

use crate::assembly::{self, AssemblyRules, DocumentMetadata};
use crate::blob::BlobStore;
use crate::capability::{CritiqueCapability, GenerationCapability};
use crate::config::{resolve, ForgeConfig};
use crate::critic::{CriticResult, Rubric};
use crate::document::{AggregateDocument, Artifact};
use crate::error::PipelineError;
use crate::extraction::{ExtractionInput, ExtractionStage};
use crate::metrics::{
    MetricsSnapshot, STAGE_ASSEMBLY, STAGE_EXTRACTION, STAGE_STORAGE, STAGE_UPSERT,
};
use crate::retry::backoff::BackoffPolicy;
use crate::retry::{RetryController, StagePlan};
use crate::storage::{StorageManager, StorageMode};
use crate::store::{DocumentStore, VersionRecord};
use crate::types::{new_execution_id, DocVersion, NaturalKey, RecordId};
use crate::versioning::{UpsertAction, UpsertMetadata, VersionBump, VersionManager};
use crate::workspace::{ExecutionContext, RetentionPolicy};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

/// One generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub natural_key: NaturalKey,
    #[serde(default)]
    pub generation_parameters: serde_json::Value,
    #[serde(default)]
    pub force: bool,
    /// Falls back to the pipeline settings when unset
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub field_limit: Option<usize>,
    #[serde(default)]
    pub version_bump: VersionBump,
    #[serde(default)]
    pub parent_id: Option<RecordId>,
    #[serde(default)]
    pub level: Option<String>,
}

impl PipelineRequest {
    pub fn new(natural_key: NaturalKey) -> Self {
        Self {
            natural_key,
            generation_parameters: serde_json::Value::Null,
            force: false,
            max_retries: None,
            field_limit: None,
            version_bump: VersionBump::None,
            parent_id: None,
            level: None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut problems = match self.natural_key.validate() {
            Ok(()) => Vec::new(),
            Err(problems) => problems,
        };
        if self.max_retries == Some(0) {
            problems.push("max_retries must be at least 1".to_string());
        }
        if self.field_limit == Some(0) {
            problems.push("field_limit must be positive".to_string());
        }
        if self.parent_id.as_deref().is_some_and(|p| p.trim().is_empty()) {
            problems.push("parent_id must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::StructuralValidation(problems))
        }
    }
}

/// An optional stage that was rejected or failed; the execution went on without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub error_kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub execution_id: String,
    pub natural_key: NaturalKey,
    pub record_id: RecordId,
    pub version: DocVersion,
    pub action: UpsertAction,
    pub storage_mode: StorageMode,
    pub trimmed: bool,
    pub attempt_history: Vec<CriticResult>,
    pub total_cost: f64,
    pub stage_failures: Vec<StageFailure>,
    pub metrics: MetricsSnapshot,
}

/// A failed execution with what it left behind.
#[derive(Debug, Error)]
#[error("execution {execution_id} failed: {error}")]
pub struct ExecutionFailure {
    pub execution_id: String,
    #[source]
    pub error: PipelineError,
    pub attempt_history: Vec<CriticResult>,
    /// Retained workspace holding accepted artifacts and the assembled document
    pub workspace: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub natural_key: NaturalKey,
    pub failure: ExecutionFailure,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub successes: Vec<PipelineResponse>,
    pub failures: Vec<BatchFailure>,
}

/// Execution-wide settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Where execution workspaces are written. `None` keeps them in memory only.
    pub workspace_root: Option<PathBuf>,
    pub retention: RetentionPolicy,
    pub budget: Duration,
    pub backoff: BackoffPolicy,
    /// Used when a request leaves `max_retries` unset
    pub max_retries: usize,
    /// Used when a request leaves `field_limit` unset
    pub field_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workspace_root: Some(std::env::temp_dir().join("docforge")),
            retention: RetentionPolicy::default(),
            budget: Duration::from_secs(600),
            backoff: BackoffPolicy::default(),
            max_retries: 3,
            field_limit: 100_000,
        }
    }
}

impl PipelineSettings {
    fn limits_for(&self, request: &PipelineRequest) -> (usize, usize) {
        (
            request.max_retries.unwrap_or(self.max_retries),
            request.field_limit.unwrap_or(self.field_limit),
        )
    }
}

pub struct Pipeline {
    versions: VersionManager,
    storage: StorageManager,
    controller: RetryController,
    extraction: ExtractionStage,
    stages: Vec<StagePlan>,
    rules: AssemblyRules,
    settings: PipelineSettings,
}

pub struct PipelineBuilder {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    generator: Arc<dyn GenerationCapability>,
    critic: Arc<dyn CritiqueCapability>,
    extraction: ExtractionStage,
    stages: Vec<StagePlan>,
    rules: AssemblyRules,
    settings: PipelineSettings,
}

impl PipelineBuilder {
    pub fn stages(mut self, stages: Vec<StagePlan>) -> Self {
        self.stages = stages;
        self
    }

    pub fn extraction(mut self, extraction: ExtractionStage) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn rules(mut self, rules: AssemblyRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Apply stages, rules and settings from a loaded configuration.
    pub fn with_config(self, config: &ForgeConfig, workspace_root: &Path) -> Self {
        let settings = PipelineSettings {
            workspace_root: Some(resolve(workspace_root, &config.pipeline.workspace_dir)),
            retention: config.pipeline.retention,
            budget: config.pipeline.budget(),
            backoff: config.pipeline.backoff.clone(),
            max_retries: config.pipeline.max_retries,
            field_limit: config.pipeline.field_limit,
        };
        self.stages(config.pipeline.stage_plans(&config.rubric))
            .extraction(ExtractionStage::standard(config.pipeline.require_predecessor))
            .rules(config.assembly.clone())
            .settings(settings)
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::ConfigError(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        if self.settings.max_retries == 0 || self.settings.field_limit == 0 {
            return Err(PipelineError::ConfigError(
                "max_retries and field_limit must be positive".to_string(),
            ));
        }
        for stage in &self.stages {
            stage
                .rubric
                .validate()
                .map_err(|e| PipelineError::ConfigError(format!("stage '{}': {}", stage.name, e)))?;
        }
        Ok(Pipeline {
            versions: VersionManager::new(self.store),
            storage: StorageManager::new(self.blobs, self.settings.backoff.clone()),
            controller: RetryController::new(
                self.generator,
                self.critic,
                self.settings.backoff.clone(),
            ),
            extraction: self.extraction,
            stages: self.stages,
            rules: self.rules,
            settings: self.settings,
        })
    }
}

impl Pipeline {
    pub fn builder(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        generator: Arc<dyn GenerationCapability>,
        critic: Arc<dyn CritiqueCapability>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            store,
            blobs,
            generator,
            critic,
            extraction: ExtractionStage::default(),
            stages: vec![StagePlan::required("content", Rubric::default())],
            rules: AssemblyRules::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Run one request end to end.
    pub async fn execute(&self, request: PipelineRequest) -> Result<PipelineResponse, ExecutionFailure> {
        let execution_id = new_execution_id();
        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            natural_key = %request.natural_key
        );
        let mut ctx = ExecutionContext::new(
            execution_id,
            request.natural_key.clone(),
            self.settings.workspace_root.as_deref(),
            self.settings.budget,
        );

        let result = self.run(&mut ctx, &request).instrument(span.clone()).await;
        let _entered = span.enter();
        match result {
            Ok(response) => {
                ctx.finish(true, self.settings.retention);
                info!(
                    record_id = %response.record_id,
                    version = %response.version,
                    action = %response.action,
                    storage_mode = %response.storage_mode,
                    attempts = ctx.attempt_count,
                    total_cost = response.total_cost,
                    "Execution succeeded"
                );
                Ok(response)
            }
            Err(error) => {
                let workspace = ctx.finish(false, self.settings.retention);
                warn!(
                    error_kind = error.kind(),
                    error = %error,
                    attempts = ctx.attempt_count,
                    workspace = ?workspace,
                    "Execution failed"
                );
                Err(ExecutionFailure {
                    execution_id: ctx.execution_id.clone(),
                    error,
                    attempt_history: std::mem::take(&mut ctx.attempt_history),
                    workspace,
                })
            }
        }
    }

    /// Run requests with at most `concurrency` executions in flight.
    pub async fn execute_batch(
        &self,
        requests: Vec<PipelineRequest>,
        concurrency: usize,
    ) -> BatchOutcome {
        let results: Vec<_> = stream::iter(requests)
            .map(|request| async move {
                let key = request.natural_key.clone();
                (key, self.execute(request).await)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (natural_key, result) in results {
            match result {
                Ok(response) => outcome.successes.push(response),
                Err(failure) => outcome.failures.push(BatchFailure {
                    natural_key,
                    failure,
                }),
            }
        }
        info!(
            successes = outcome.successes.len(),
            failures = outcome.failures.len(),
            "Batch finished"
        );
        outcome
    }

    /// Current record and its decoded document.
    pub async fn load(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<(VersionRecord, AggregateDocument)>, PipelineError> {
        let Some(record) = self.versions.find_current(key)? else {
            return Ok(None);
        };
        let document = self.storage.load(&record.storage_field).await?;
        Ok(Some((record, document)))
    }

    async fn run(
        &self,
        ctx: &mut ExecutionContext,
        request: &PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        request.validate()?;
        let (max_retries, field_limit) = self.settings.limits_for(request);

        let input = ExtractionInput {
            natural_key: &request.natural_key,
            parameters: &request.generation_parameters,
            parent_id: request.parent_id.as_deref(),
            versions: &self.versions,
            storage: &self.storage,
        };
        let extraction = ctx
            .within_budget(ctx.metrics.time(STAGE_EXTRACTION, self.extraction.run(&input)))
            .await?;
        ctx.metrics
            .record_bytes(STAGE_EXTRACTION, 0, extraction.total_bytes());
        let mut context = extraction.context;

        let mut accepted: Vec<Artifact> = Vec::new();
        let mut stage_failures = Vec::new();
        for stage in &self.stages {
            match self
                .controller
                .run(ctx, stage, &context, max_retries)
                .await
            {
                Ok(result) => {
                    let artifact = result.artifact;
                    if let Ok(bytes) = serde_json::to_vec(&artifact) {
                        context.insert(format!("stage.{}", stage.name), bytes);
                    }
                    ctx.workspace.put_artifact(artifact.clone());
                    accepted.push(artifact);
                }
                Err(e) if stage.optional && degrades(&e) => {
                    warn!(
                        stage = %stage.name,
                        error_kind = e.kind(),
                        error = %e,
                        "Optional stage failed, continuing without it"
                    );
                    stage_failures.push(StageFailure {
                        stage: stage.name.clone(),
                        error_kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let plan = self.versions.plan(
            &request.natural_key,
            request.force,
            request.version_bump,
        )?;
        let metadata = DocumentMetadata {
            natural_key: request.natural_key.clone(),
            version: plan.version,
            status: plan.status,
            fields: document_fields(ctx, request),
        };
        let document = ctx
            .metrics
            .time(STAGE_ASSEMBLY, async {
                assembly::assemble(&accepted, metadata, &self.rules)
            })
            .await?;
        ctx.workspace.set_document(document.clone());

        let stored = ctx
            .within_budget(
                ctx.metrics
                    .time(STAGE_STORAGE, self.storage.store(&document, field_limit)),
            )
            .await?;
        ctx.metrics.record_bytes(
            STAGE_STORAGE,
            stored.encoded_len,
            stored.field.to_string().len(),
        );

        let upsert_metadata = UpsertMetadata {
            version_bump: request.version_bump,
            level: request.level.clone(),
            parent_id: request.parent_id.clone(),
            status: None,
        };
        let storage_field = stored.field.to_string();
        let outcome = ctx
            .metrics
            .time(STAGE_UPSERT, async {
                self.versions.upsert(
                    &request.natural_key,
                    &storage_field,
                    &upsert_metadata,
                    request.force,
                )
            })
            .await?;
        if outcome.version != document.version {
            warn!(
                planned = %document.version,
                written = %outcome.version,
                "Record changed between planning and upsert"
            );
        }

        Ok(PipelineResponse {
            execution_id: ctx.execution_id.clone(),
            natural_key: request.natural_key.clone(),
            record_id: outcome.record_id,
            version: outcome.version,
            action: outcome.action,
            storage_mode: stored.mode(),
            trimmed: stored.trimmed,
            attempt_history: ctx.attempt_history.clone(),
            total_cost: ctx.accumulated_cost,
            stage_failures,
            metrics: ctx.metrics.snapshot(),
        })
    }
}

/// Failures an optional stage may absorb. Timeouts and fatal request errors never degrade.
fn degrades(error: &PipelineError) -> bool {
    matches!(error, PipelineError::Rejected { .. }) || error.is_transient()
}

fn document_fields(ctx: &ExecutionContext, request: &PipelineRequest) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("execution_id".to_string(), ctx.execution_id.clone());
    if let Some(level) = &request.level {
        fields.insert("level".to_string(), level.clone());
    }
    if let Some(parent_id) = &request.parent_id {
        fields.insert("parent_id".to_string(), parent_id.clone());
    }
    fields
}
