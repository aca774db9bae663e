//! Execution context and per-execution workspace
//!
//! Stages hand artifacts to each other through the workspace's in-memory map,
//! keyed by stage name. The map can be dumped to disk for inspection; at the
//! end of an execution the workspace is either removed or retained.

use crate::critic::CriticResult;
use crate::document::{AggregateDocument, Artifact};
use crate::error::{PipelineError, StorageError};
use crate::metrics::{MetricsSnapshot, MetricsTracker};
use crate::types::NaturalKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// When a finished execution keeps its workspace on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Always,
    OnFailure,
    /// Only keeps workspaces whose accepted artifacts never reached the store.
    Never,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::OnFailure
    }
}

pub struct Workspace {
    execution_id: String,
    dir: Option<PathBuf>,
    artifacts: BTreeMap<String, Artifact>,
    document: Option<AggregateDocument>,
}

impl Workspace {
    /// Create a workspace; `root` enables dumping to `{root}/{execution_id}/`.
    pub fn new(execution_id: &str, root: Option<&Path>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            dir: root.map(|r| r.join(execution_id)),
            artifacts: BTreeMap::new(),
            document: None,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Record the accepted artifact for its stage, replacing any earlier one.
    pub fn put_artifact(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.stage.clone(), artifact);
    }

    pub fn artifact(&self, stage: &str) -> Option<&Artifact> {
        self.artifacts.get(stage)
    }

    pub fn artifacts(&self) -> &BTreeMap<String, Artifact> {
        &self.artifacts
    }

    pub fn set_document(&mut self, document: AggregateDocument) {
        self.document = Some(document);
    }

    pub fn document(&self) -> Option<&AggregateDocument> {
        self.document.as_ref()
    }

    pub fn has_unpersisted_output(&self) -> bool {
        !self.artifacts.is_empty() || self.document.is_some()
    }

    /// Write artifacts, document, history and metrics as JSON files.
    pub fn dump(
        &self,
        history: &[CriticResult],
        metrics: &MetricsSnapshot,
    ) -> Result<Option<PathBuf>, StorageError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let artifacts_dir = dir.join("artifacts");
        fs::create_dir_all(&artifacts_dir)?;
        for (stage, artifact) in &self.artifacts {
            write_json(&artifacts_dir.join(format!("{}.json", stage)), artifact)?;
        }
        if let Some(document) = &self.document {
            write_json(&dir.join("document.json"), document)?;
        }
        write_json(&dir.join("history.json"), &history)?;
        write_json(&dir.join("metrics.json"), metrics)?;
        debug!(execution_id = %self.execution_id, dir = %dir.display(), "Workspace dumped");
        Ok(Some(dir.clone()))
    }

    fn remove(&self) {
        if let Some(dir) = &self.dir {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove workspace");
                }
            }
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| {
        StorageError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    fs::write(path, bytes)?;
    Ok(())
}

/// State owned by exactly one execution.
pub struct ExecutionContext {
    pub execution_id: String,
    pub natural_key: NaturalKey,
    pub workspace: Workspace,
    /// Generation calls made so far, across all stages
    pub attempt_count: usize,
    pub accumulated_cost: f64,
    pub attempt_history: Vec<CriticResult>,
    pub metrics: MetricsTracker,
    deadline: Instant,
    budget: Duration,
}

impl ExecutionContext {
    pub fn new(
        execution_id: String,
        natural_key: NaturalKey,
        workspace_root: Option<&Path>,
        budget: Duration,
    ) -> Self {
        let workspace = Workspace::new(&execution_id, workspace_root);
        Self {
            execution_id,
            natural_key,
            workspace,
            attempt_count: 0,
            accumulated_cost: 0.0,
            attempt_history: Vec::new(),
            metrics: MetricsTracker::new(),
            deadline: Instant::now() + budget,
            budget,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn add_cost(&mut self, stage: &str, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.accumulated_cost += cost;
            self.metrics.add_cost(stage, cost);
        }
    }

    /// Bound `fut` by the execution deadline.
    pub async fn within_budget<T, Fut>(&self, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::GenerationTimeout(self.budget)),
        }
    }

    /// Close the workspace. Returns the retained directory, if any.
    pub fn finish(&self, succeeded: bool, policy: RetentionPolicy) -> Option<PathBuf> {
        let retain = match policy {
            RetentionPolicy::Always => true,
            RetentionPolicy::OnFailure => !succeeded,
            RetentionPolicy::Never => !succeeded && self.workspace.has_unpersisted_output(),
        };
        if !retain {
            self.workspace.remove();
            return None;
        }
        match self
            .workspace
            .dump(&self.attempt_history, &self.metrics.snapshot())
        {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    execution_id = %self.execution_id,
                    error = %e,
                    "Failed to retain workspace"
                );
                None
            }
        }
    }
}
