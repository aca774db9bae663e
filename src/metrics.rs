//! Per-stage metrics and cost tracking for one execution.

use crate::error::PipelineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

pub const STAGE_EXTRACTION: &str = "extraction";
pub const STAGE_GENERATION: &str = "generation";
pub const STAGE_CRITIQUE: &str = "critique";
pub const STAGE_ASSEMBLY: &str = "assembly";
pub const STAGE_STORAGE: &str = "storage";
pub const STAGE_UPSERT: &str = "upsert";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Timed invocations, including the transient retries inside them
    pub calls: u64,
    pub failures: u64,
    /// Completed attempts, one per draft or critique handed to the retry controller
    pub attempts: u64,
    /// Transient errors retried with backoff
    pub retries: u64,
    pub cost: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_cost: f64,
}

impl MetricsSnapshot {
    pub fn stage(&self, name: &str) -> StageMetrics {
        self.stages.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct MetricsTracker {
    stages: Mutex<BTreeMap<String, StageMetrics>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stage<F: FnOnce(&mut StageMetrics)>(&self, stage: &str, f: F) {
        let mut stages = self.stages.lock();
        f(stages.entry(stage.to_string()).or_default());
    }

    pub fn record_call(&self, stage: &str, elapsed: Duration, succeeded: bool) {
        self.with_stage(stage, |m| {
            m.calls += 1;
            if !succeeded {
                m.failures += 1;
            }
            m.elapsed_ms += elapsed.as_millis() as u64;
        });
    }

    pub fn record_attempt(&self, stage: &str) {
        self.with_stage(stage, |m| m.attempts += 1);
    }

    pub fn record_retries(&self, stage: &str, retries: usize) {
        if retries > 0 {
            self.with_stage(stage, |m| m.retries += retries as u64);
        }
    }

    pub fn add_cost(&self, stage: &str, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.with_stage(stage, |m| m.cost += cost);
        }
    }

    pub fn record_bytes(&self, stage: &str, bytes_in: usize, bytes_out: usize) {
        self.with_stage(stage, |m| {
            m.bytes_in += bytes_in as u64;
            m.bytes_out += bytes_out as u64;
        });
    }

    /// Await `fut`, recording one call against `stage` with its duration and outcome.
    pub async fn time<T, Fut>(&self, stage: &str, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record_call(stage, started.elapsed(), result.is_ok());
        result
    }

    pub fn total_cost(&self) -> f64 {
        self.stages.lock().values().map(|m| m.cost).sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self.stages.lock().clone();
        let total_cost = stages.values().map(|m| m.cost).sum();
        MetricsSnapshot { stages, total_cost }
    }
}
