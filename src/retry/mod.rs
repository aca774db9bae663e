//! Retry controller
//!
//! Drives one stage through `Drafting -> Critiquing -> {Accepted | Drafting | Rejected}`.
//! `max_retries` is the total number of generation calls a stage may make.
//! Critic feedback from a failed attempt is handed to the next draft.

pub mod backoff;

use crate::capability::{
    CritiqueCapability, GenerationCapability, GenerationContext, FEEDBACK_CONTEXT_KEY,
};
use crate::critic::{CriticResult, Rubric};
use crate::document::Artifact;
use crate::error::PipelineError;
use crate::metrics::{STAGE_CRITIQUE, STAGE_GENERATION};
use crate::workspace::ExecutionContext;
use backoff::{retry_transient, BackoffPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Drafting,
    Critiquing,
    Accepted,
    Rejected,
}

/// One stage of generation: a name and the rubric its artifacts are judged by.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub rubric: Rubric,
    /// Optional stages may be rejected without failing the execution
    pub optional: bool,
}

impl StagePlan {
    pub fn required(name: impl Into<String>, rubric: Rubric) -> Self {
        Self {
            name: name.into(),
            rubric,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, rubric: Rubric) -> Self {
        Self {
            name: name.into(),
            rubric,
            optional: true,
        }
    }
}

/// Accepted artifact plus every critique it took to get there.
#[derive(Debug, Clone)]
pub struct AcceptedArtifact {
    pub artifact: Artifact,
    pub history: Vec<CriticResult>,
}

pub struct RetryController {
    generator: Arc<dyn GenerationCapability>,
    critic: Arc<dyn CritiqueCapability>,
    backoff: BackoffPolicy,
}

impl RetryController {
    pub fn new(
        generator: Arc<dyn GenerationCapability>,
        critic: Arc<dyn CritiqueCapability>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            generator,
            critic,
            backoff,
        }
    }

    /// Run `stage` until an artifact is accepted or `max_retries` drafts were rejected.
    ///
    /// Every critique is also appended to `ctx.attempt_history`, so the history
    /// survives errors that abort the loop early.
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        stage: &StagePlan,
        context: &GenerationContext,
        max_retries: usize,
    ) -> Result<AcceptedArtifact, PipelineError> {
        if max_retries == 0 {
            return Err(PipelineError::StructuralValidation(vec![
                "max_retries must be at least 1".to_string(),
            ]));
        }

        let mut history: Vec<CriticResult> = Vec::new();
        let mut feedback: Option<Vec<String>> = None;
        let mut attempt = 1usize;
        let mut state = RetryState::Drafting;

        loop {
            debug!(
                execution_id = %ctx.execution_id,
                stage = %stage.name,
                attempt,
                ?state,
                "Retry controller transition"
            );

            // Drafting
            let draft_context = with_feedback(context, feedback.as_deref());
            let artifact = self
                .draft(ctx, &stage.name, &draft_context, feedback.as_deref())
                .await?;
            ctx.attempt_count += 1;
            ctx.metrics.record_attempt(STAGE_GENERATION);
            ctx.add_cost(STAGE_GENERATION, artifact.cost);
            state = RetryState::Critiquing;
            debug!(
                execution_id = %ctx.execution_id,
                stage = %stage.name,
                attempt,
                ?state,
                "Retry controller transition"
            );

            // Critiquing
            let verdict = self.critique(ctx, &artifact, &stage.rubric).await?;
            ctx.metrics.record_attempt(STAGE_CRITIQUE);
            ctx.add_cost(STAGE_CRITIQUE, verdict.cost);
            history.push(verdict.clone());
            ctx.attempt_history.push(verdict.clone());

            if verdict.overall_pass {
                state = RetryState::Accepted;
                info!(
                    execution_id = %ctx.execution_id,
                    stage = %stage.name,
                    attempt,
                    weighted_score = verdict.weighted_score,
                    ?state,
                    "Artifact accepted"
                );
                return Ok(AcceptedArtifact { artifact, history });
            }

            if attempt < max_retries {
                warn!(
                    execution_id = %ctx.execution_id,
                    stage = %stage.name,
                    attempt,
                    max_retries,
                    failing = ?verdict.failing_dimensions(),
                    "Artifact failed critique, redrafting with feedback"
                );
                attempt += 1;
                feedback = Some(verdict.feedback.clone());
                state = RetryState::Drafting;
                continue;
            }

            state = RetryState::Rejected;
            warn!(
                execution_id = %ctx.execution_id,
                stage = %stage.name,
                attempts = attempt,
                ?state,
                "Stage rejected, retries exhausted"
            );
            return Err(PipelineError::Rejected {
                stage: stage.name.clone(),
                history,
            });
        }
    }

    async fn draft(
        &self,
        ctx: &ExecutionContext,
        stage: &str,
        context: &GenerationContext,
        feedback: Option<&[String]>,
    ) -> Result<Artifact, PipelineError> {
        let generator = Arc::clone(&self.generator);
        let tries = AtomicUsize::new(0);
        let call = retry_transient(&self.backoff, "generate", || {
            tries.fetch_add(1, Ordering::Relaxed);
            let generator = Arc::clone(&generator);
            async move { generator.generate(stage, context, feedback).await }
        });
        let result = ctx
            .within_budget(ctx.metrics.time(STAGE_GENERATION, call))
            .await;
        ctx.metrics.record_retries(
            STAGE_GENERATION,
            tries.load(Ordering::Relaxed).saturating_sub(1),
        );
        let mut artifact = result?;
        if artifact.stage != stage {
            artifact.stage = stage.to_string();
        }
        Ok(artifact)
    }

    async fn critique(
        &self,
        ctx: &ExecutionContext,
        artifact: &Artifact,
        rubric: &Rubric,
    ) -> Result<CriticResult, PipelineError> {
        let critic = Arc::clone(&self.critic);
        let tries = AtomicUsize::new(0);
        let call = retry_transient(&self.backoff, "critique", || {
            tries.fetch_add(1, Ordering::Relaxed);
            let critic = Arc::clone(&critic);
            async move { critic.critique(artifact, rubric).await }
        });
        let result = ctx
            .within_budget(ctx.metrics.time(STAGE_CRITIQUE, call))
            .await;
        ctx.metrics.record_retries(
            STAGE_CRITIQUE,
            tries.load(Ordering::Relaxed).saturating_sub(1),
        );
        let reported = result?;
        Ok(rubric.reconcile(reported))
    }
}

/// Copy of `context` with prior critic feedback appended, one item per line.
fn with_feedback(context: &GenerationContext, feedback: Option<&[String]>) -> GenerationContext {
    let mut context = context.clone();
    if let Some(items) = feedback {
        context.insert(FEEDBACK_CONTEXT_KEY.to_string(), items.join("\n").into_bytes());
    }
    context
}
