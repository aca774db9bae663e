//! Configuration System
//!
//! Layered configuration: built-in defaults, then the global file, then the
//! workspace files, then `DOCFORGE__SECTION__KEY` environment variables.
//! The merged result is validated before anything is built from it.

use crate::assembly::AssemblyRules;
use crate::critic::Rubric;
use crate::logging::LoggingConfig;
use crate::retry::backoff::BackoffPolicy;
use crate::retry::StagePlan;
use crate::workspace::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod facade;
mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    /// Default rubric for stages that do not carry their own
    #[serde(default)]
    pub rubric: Rubric,

    #[serde(default)]
    pub assembly: AssemblyRules,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub rubric: Option<Rubric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default for requests that do not set `max_retries`
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Default inline field limit, in encoded characters
    #[serde(default = "default_field_limit")]
    pub field_limit: usize,

    /// Wall-clock budget per execution
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,

    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Where execution workspaces are dumped, relative to the workspace root
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Fail extraction when a document's predecessor has no current record
    #[serde(default)]
    pub require_predecessor: bool,

    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,

    /// Backoff for transient service and blob store errors
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_retries() -> usize {
    3
}

fn default_field_limit() -> usize {
    100_000
}

fn default_budget_secs() -> u64 {
    600
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".docforge/workspaces")
}

fn default_stages() -> Vec<StageConfig> {
    vec![StageConfig {
        name: "content".to_string(),
        optional: false,
        rubric: None,
    }]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            field_limit: default_field_limit(),
            budget_secs: default_budget_secs(),
            batch_concurrency: default_batch_concurrency(),
            retention: RetentionPolicy::default(),
            workspace_dir: default_workspace_dir(),
            require_predecessor: false,
            stages: default_stages(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    /// Stage plans, falling back to `default_rubric` where a stage has none.
    pub fn stage_plans(&self, default_rubric: &Rubric) -> Vec<StagePlan> {
        self.stages
            .iter()
            .map(|stage| StagePlan {
                name: stage.name.clone(),
                rubric: stage.rubric.clone().unwrap_or_else(|| default_rubric.clone()),
                optional: stage.optional,
            })
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }
        if self.field_limit == 0 {
            return Err("field_limit must be positive".to_string());
        }
        if self.budget_secs == 0 {
            return Err("budget_secs must be positive".to_string());
        }
        if self.batch_concurrency == 0 {
            return Err("batch_concurrency must be at least 1".to_string());
        }
        if self.stages.is_empty() {
            return Err("at least one stage is required".to_string());
        }
        if !self.stages.iter().any(|s| !s.optional) {
            return Err("at least one stage must be required".to_string());
        }
        let mut names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("duplicate stage '{}'", pair[0]));
        }
        if self.stages.iter().any(|s| s.name.trim().is_empty()) {
            return Err("stage names must not be empty".to_string());
        }
        Ok(())
    }
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default = "default_blob_path")]
    pub blob_path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".docforge/store")
}

fn default_blob_path() -> PathBuf {
    PathBuf::from(".docforge/blobs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            blob_path: default_blob_path(),
        }
    }
}

impl StorageConfig {
    /// Resolve the store path against `workspace_root` when relative
    pub fn store_dir(&self, workspace_root: &Path) -> PathBuf {
        resolve(workspace_root, &self.store_path)
    }

    pub fn blob_dir(&self, workspace_root: &Path) -> PathBuf {
        resolve(workspace_root, &self.blob_path)
    }
}

pub(crate) fn resolve(workspace_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub generation: ServiceEndpoint,
    #[serde(default)]
    pub critique: ServiceEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ServiceEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("endpoint '{}' must be an http(s) URL", endpoint));
            }
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Pipeline(String),
    Service(String, String),
    Rubric(String, String),
    Assembly(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Service(name, msg) => write!(f, "Service '{}': {}", name, msg),
            ValidationError::Rubric(owner, msg) => write!(f, "Rubric '{}': {}", owner, msg),
            ValidationError::Assembly(msg) => write!(f, "Assembly: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ForgeConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }

        for (name, service) in [
            ("generation", &self.services.generation),
            ("critique", &self.services.critique),
        ] {
            if let Err(e) = service.validate() {
                errors.push(ValidationError::Service(name.to_string(), e));
            }
        }

        if let Err(e) = self.rubric.validate() {
            errors.push(ValidationError::Rubric("default".to_string(), e));
        }
        for stage in &self.pipeline.stages {
            if let Some(rubric) = &stage.rubric {
                if let Err(e) = rubric.validate() {
                    errors.push(ValidationError::Rubric(stage.name.clone(), e));
                }
            }
        }

        if self.assembly.min_entries > self.assembly.max_entries {
            errors.push(ValidationError::Assembly(format!(
                "min_entries {} exceeds max_entries {}",
                self.assembly.min_entries, self.assembly.max_entries
            )));
        }

        if !matches!(self.logging.format.as_str(), "json" | "text") {
            errors.push(ValidationError::Logging(format!(
                "format '{}' must be 'json' or 'text'",
                self.logging.format
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
