//! CLI route: single route table and run context. Dispatches to the pipeline,
//! the version manager and the reconciler, then to presentation.

use crate::blob::{BlobStore, FsBlobStore};
use crate::capability::{HttpCritiqueClient, HttpGenerationClient};
use crate::cli::parse::{Commands, OutputFormat};
use crate::cli::presentation::{
    format_batch_text, format_history_text, format_reconcile_text, format_response_text,
};
use crate::config::{ConfigLoader, ForgeConfig};
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineRequest};
use crate::reconcile::Reconciler;
use crate::storage::StorageManager;
use crate::store::{DocumentStore, SledDocumentStore};
use crate::types::NaturalKey;
use crate::versioning::VersionManager;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Runtime context for CLI execution: workspace, config and opened stores.
pub struct RunContext {
    workspace_root: PathBuf,
    config: ForgeConfig,
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
}

/// A request file holds one request or a list of them.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum RequestFile {
    Many(Vec<PipelineRequest>),
    One(PipelineRequest),
}

fn to_json<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::CorruptPayload(format!("Failed to render JSON: {}", e)))
}

impl RunContext {
    /// Load and validate configuration, then open the document and blob stores.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = ConfigLoader::load_validated(&workspace_root, config_path.as_deref())?;

        let store_dir = config.storage.store_dir(&workspace_root);
        std::fs::create_dir_all(&store_dir).map_err(crate::error::StorageError::from)?;
        let store: Arc<dyn DocumentStore> = Arc::new(SledDocumentStore::new(&store_dir)?);
        let blobs: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(config.storage.blob_dir(&workspace_root))?);

        info!(
            workspace = %workspace_root.display(),
            store = %store_dir.display(),
            "CLI context initialized"
        );
        Ok(Self {
            workspace_root,
            config,
            store,
            blobs,
        })
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, PipelineError> {
        match command {
            Commands::Run {
                request,
                concurrency,
                format,
            } => self.run(request, *concurrency, *format).await,
            Commands::Load { natural_key } => self.load(natural_key).await,
            Commands::History {
                natural_key,
                format,
            } => self.history(natural_key, *format),
            Commands::Reconcile { dry_run, format } => {
                let report = Reconciler::new(Arc::clone(&self.store), Arc::clone(&self.blobs))
                    .run(*dry_run)?;
                match format {
                    OutputFormat::Json => to_json(&report),
                    OutputFormat::Text => Ok(format_reconcile_text(&report)),
                }
            }
        }
    }

    fn build_pipeline(&self) -> Result<Pipeline, PipelineError> {
        let services = &self.config.services;
        let generation_endpoint = services.generation.endpoint.clone().ok_or_else(|| {
            PipelineError::ConfigError("services.generation.endpoint is not set".to_string())
        })?;
        let critique_endpoint = services.critique.endpoint.clone().ok_or_else(|| {
            PipelineError::ConfigError("services.critique.endpoint is not set".to_string())
        })?;
        let generator = HttpGenerationClient::new(
            generation_endpoint,
            services.generation.api_key.clone(),
            services.generation.timeout(),
        )?;
        let critic = HttpCritiqueClient::new(
            critique_endpoint,
            services.critique.api_key.clone(),
            services.critique.timeout(),
        )?;
        Pipeline::builder(
            Arc::clone(&self.store),
            Arc::clone(&self.blobs),
            Arc::new(generator),
            Arc::new(critic),
        )
        .with_config(&self.config, &self.workspace_root)
        .build()
    }

    async fn run(
        &self,
        request_path: &Path,
        concurrency: Option<usize>,
        format: OutputFormat,
    ) -> Result<String, PipelineError> {
        let raw = std::fs::read_to_string(request_path).map_err(crate::error::StorageError::from)?;
        let parsed: RequestFile = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::StructuralValidation(vec![format!(
                "{}: {}",
                request_path.display(),
                e
            )])
        })?;
        let pipeline = self.build_pipeline()?;

        match parsed {
            RequestFile::One(request) => match pipeline.execute(request).await {
                Ok(response) => match format {
                    OutputFormat::Json => to_json(&response),
                    OutputFormat::Text => Ok(format_response_text(&response)),
                },
                Err(failure) => {
                    if let Some(dir) = &failure.workspace {
                        eprintln!("Workspace retained at {}", dir.display());
                    }
                    Err(failure.error)
                }
            },
            RequestFile::Many(requests) => {
                let concurrency = concurrency.unwrap_or(self.config.pipeline.batch_concurrency);
                let outcome = pipeline.execute_batch(requests, concurrency).await;
                match format {
                    OutputFormat::Json => {
                        let failures: Vec<_> = outcome
                            .failures
                            .iter()
                            .map(|f| {
                                json!({
                                    "natural_key": f.natural_key.to_string(),
                                    "execution_id": f.failure.execution_id,
                                    "error_kind": f.failure.error.kind(),
                                    "error": f.failure.error.to_string(),
                                    "attempts": f.failure.attempt_history.len(),
                                    "workspace": f.failure.workspace,
                                })
                            })
                            .collect();
                        to_json(&json!({
                            "successes": outcome.successes,
                            "failures": failures,
                        }))
                    }
                    OutputFormat::Text => Ok(format_batch_text(&outcome)),
                }
            }
        }
    }

    async fn load(&self, natural_key: &str) -> Result<String, PipelineError> {
        let key: NaturalKey = natural_key.parse()?;
        let versions = VersionManager::new(Arc::clone(&self.store));
        let record = versions.find_current(&key)?.ok_or_else(|| {
            PipelineError::Storage(crate::error::StorageError::RecordNotFound(key.to_string()))
        })?;
        let storage = StorageManager::new(
            Arc::clone(&self.blobs),
            self.config.pipeline.backoff.clone(),
        );
        let document = storage.load(&record.storage_field).await?;
        to_json(&document)
    }

    fn history(&self, natural_key: &str, format: OutputFormat) -> Result<String, PipelineError> {
        let key: NaturalKey = natural_key.parse()?;
        let records = VersionManager::new(Arc::clone(&self.store)).history(&key)?;
        match format {
            OutputFormat::Json => {
                let rows: Vec<_> = records
                    .iter()
                    .map(|r| {
                        json!({
                            "record_id": r.record_id,
                            "version": r.version.to_string(),
                            "status": r.status,
                            "storage_field": r.storage_field,
                            "level": r.level,
                            "parent_id": r.parent_id,
                            "created_at": r.created_at,
                            "updated_at": r.updated_at,
                        })
                    })
                    .collect();
                to_json(&rows)
            }
            OutputFormat::Text => Ok(format_history_text(&records)),
        }
    }
}
