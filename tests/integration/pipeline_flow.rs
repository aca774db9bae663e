//! End-to-end executions against stub capabilities.

use super::support::{Harness, ScriptedCritic, StubGenerator, CRITIQUE_COST, GENERATION_COST};
use docforge::capability::FEEDBACK_CONTEXT_KEY;
use docforge::critic::Rubric;
use docforge::document::EntryKind;
use docforge::extraction::ExtractionStage;
use docforge::metrics::{STAGE_CRITIQUE, STAGE_GENERATION};
use docforge::retry::StagePlan;
use docforge::storage::StorageMode;
use docforge::versioning::UpsertAction;
use docforge::workspace::RetentionPolicy;
use docforge::{NaturalKey, PipelineError, PipelineRequest, RecordStatus};
use std::time::Duration;

fn lesson(order: u32) -> PipelineRequest {
    PipelineRequest::new(NaturalKey::new("acme", "lesson", order))
}

#[tokio::test]
async fn second_draft_passes_after_feedback() {
    let harness = Harness::new(
        StubGenerator::new(),
        ScriptedCritic::passing().script("content", &[0.70, 0.92]),
    );
    let pipeline = harness.pipeline();

    let response = pipeline.execute(lesson(1)).await.unwrap();

    assert_eq!(response.attempt_history.len(), 2);
    assert!(!response.attempt_history[0].overall_pass);
    assert!(response.attempt_history[1].overall_pass);
    assert_eq!(response.action, UpsertAction::Created);
    assert_eq!(response.version.to_string(), "1");
    assert_eq!(response.storage_mode, StorageMode::Inline);
    assert!(response.stage_failures.is_empty());
    let expected_cost = 2.0 * (GENERATION_COST + CRITIQUE_COST);
    assert!((response.total_cost - expected_cost).abs() < 1e-9);
    let generation = response.metrics.stage(STAGE_GENERATION);
    assert_eq!(generation.attempts, 2);
    assert_eq!(generation.retries, 0);
    assert_eq!(response.metrics.stage(STAGE_CRITIQUE).attempts, 2);

    let calls = harness.generator.calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].feedback.is_none());
    let feedback = calls[1].feedback.as_ref().unwrap();
    assert!(feedback[0].contains("coverage"));
    assert!(calls[1].context.contains_key(FEEDBACK_CONTEXT_KEY));
}

#[tokio::test]
async fn persisted_document_matches_generated_entries() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline();

    let response = pipeline.execute(lesson(1)).await.unwrap();
    let (record, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.record_id, response.record_id);
    assert_eq!(record.status, RecordStatus::Draft);
    assert_eq!(document.entries.len(), 4);
    assert_eq!(document.entries.last().unwrap().kind, EntryKind::Terminal);
    assert_eq!(document.entry_count(EntryKind::Opening), 1);
    assert_eq!(
        document.metadata.get("execution_id"),
        Some(&response.execution_id)
    );
    assert_eq!(
        document.metadata.get("content.model").map(String::as_str),
        Some("stub-1")
    );
}

#[tokio::test]
async fn exhausted_retries_persist_nothing_and_keep_workspace() {
    let harness = Harness::new(
        StubGenerator::new(),
        ScriptedCritic::passing().failing("content"),
    );
    let pipeline = harness.pipeline();
    let mut request = lesson(1);
    request.max_retries = Some(3);

    let failure = pipeline.execute(request).await.unwrap_err();

    match &failure.error {
        PipelineError::Rejected { stage, history } => {
            assert_eq!(stage, "content");
            assert_eq!(history.len(), 3);
        }
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(harness.generator.call_count(), 3);
    assert_eq!(failure.attempt_history.len(), 3);
    assert!(pipeline
        .versions()
        .find_current(&NaturalKey::new("acme", "lesson", 1))
        .unwrap()
        .is_none());

    let dir = failure.workspace.expect("workspace retained on failure");
    assert!(dir.starts_with(harness.workspace_root()));
    assert!(dir.join("history.json").exists());
    assert!(dir.join("metrics.json").exists());
}

#[tokio::test]
async fn successful_execution_removes_workspace_under_on_failure() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline();

    let response = pipeline.execute(lesson(1)).await.unwrap();

    assert!(!harness.workspace_root().join(&response.execution_id).exists());
}

#[tokio::test]
async fn always_retention_keeps_successful_workspace() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let mut settings = harness.settings();
    settings.retention = RetentionPolicy::Always;
    let pipeline = harness.pipeline_with(
        vec![StagePlan::required("content", Rubric::default())],
        ExtractionStage::default(),
        settings,
    );

    let response = pipeline.execute(lesson(1)).await.unwrap();

    let dir = harness.workspace_root().join(&response.execution_id);
    assert!(dir.join("artifacts").join("content.json").exists());
    assert!(dir.join("document.json").exists());
}

#[tokio::test]
async fn invalid_assembly_keeps_accepted_artifacts_for_recovery() {
    let harness = Harness::new(
        StubGenerator::with_stages(&[(
            "content",
            &[EntryKind::Terminal, EntryKind::Body, EntryKind::Terminal],
        )]),
        ScriptedCritic::passing(),
    );
    let mut settings = harness.settings();
    settings.retention = RetentionPolicy::Never;
    let pipeline = harness.pipeline_with(
        vec![StagePlan::required("content", Rubric::default())],
        ExtractionStage::default(),
        settings,
    );

    let failure = pipeline.execute(lesson(1)).await.unwrap_err();

    match &failure.error {
        PipelineError::StructuralValidation(violations) => {
            assert!(violations.iter().any(|v| v.contains("terminal")));
        }
        other => panic!("unexpected error {}", other),
    }
    // Never still retains output that was accepted but not stored
    let dir = failure.workspace.expect("unpersisted output retained");
    assert!(dir.join("artifacts").join("content.json").exists());
    assert!(pipeline
        .versions()
        .find_current(&NaturalKey::new("acme", "lesson", 1))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn missing_required_predecessor_fails_before_generation() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline_with(
        vec![StagePlan::required("content", Rubric::default())],
        ExtractionStage::standard(true),
        harness.settings(),
    );

    let failure = pipeline.execute(lesson(2)).await.unwrap_err();

    assert!(matches!(
        failure.error,
        PipelineError::ExtractionFailed { ref source_name, .. } if source_name == "predecessor"
    ));
    assert_eq!(harness.generator.call_count(), 0);
    assert!(failure.attempt_history.is_empty());
}

#[tokio::test]
async fn predecessor_document_is_part_of_the_context() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline_with(
        vec![StagePlan::required("content", Rubric::default())],
        ExtractionStage::standard(true),
        harness.settings(),
    );

    pipeline.execute(lesson(1)).await.unwrap();
    pipeline.execute(lesson(2)).await.unwrap();

    let calls = harness.generator.calls.lock();
    assert!(!calls[0].context.contains_key("predecessor"));
    let previous: serde_json::Value =
        serde_json::from_slice(&calls[1].context["predecessor"]).unwrap();
    assert_eq!(previous["natural_key"]["order"], 1);
}

#[tokio::test]
async fn rejected_optional_stage_is_reported_not_fatal() {
    let harness = Harness::new(
        StubGenerator::with_stages(&[
            ("outline", &[EntryKind::Opening, EntryKind::Body]),
            ("practice", &[EntryKind::Practice]),
            ("wrapup", &[EntryKind::Terminal]),
        ]),
        ScriptedCritic::passing().failing("practice"),
    );
    let pipeline = harness.pipeline_with(
        vec![
            StagePlan::required("outline", Rubric::default()),
            StagePlan::optional("practice", Rubric::default()),
            StagePlan::required("wrapup", Rubric::default()),
        ],
        ExtractionStage::default(),
        harness.settings(),
    );
    let mut request = lesson(1);
    request.max_retries = Some(2);

    let response = pipeline.execute(request).await.unwrap();

    assert_eq!(response.stage_failures.len(), 1);
    assert_eq!(response.stage_failures[0].stage, "practice");
    assert_eq!(response.stage_failures[0].error_kind, "rejected");
    // outline once, practice twice, wrapup once
    assert_eq!(harness.generator.call_count(), 4);

    let (_, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.entries.len(), 3);
    assert_eq!(document.entry_count(EntryKind::Practice), 0);
}

#[tokio::test]
async fn later_stages_see_accepted_artifacts() {
    let harness = Harness::new(
        StubGenerator::with_stages(&[
            ("outline", &[EntryKind::Opening, EntryKind::Body]),
            ("wrapup", &[EntryKind::Terminal]),
        ]),
        ScriptedCritic::passing(),
    );
    let pipeline = harness.pipeline_with(
        vec![
            StagePlan::required("outline", Rubric::default()),
            StagePlan::required("wrapup", Rubric::default()),
        ],
        ExtractionStage::default(),
        harness.settings(),
    );

    pipeline.execute(lesson(1)).await.unwrap();

    let calls = harness.generator.calls.lock();
    assert!(!calls[0].context.contains_key("stage.outline"));
    assert!(calls[1].context.contains_key("stage.outline"));
}

#[tokio::test]
async fn invalid_request_is_fatal_and_not_retried() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline();
    let mut request = lesson(1);
    request.generation_parameters = serde_json::json!({ "reject_request": true });

    let failure = pipeline.execute(request).await.unwrap_err();

    assert!(matches!(failure.error, PipelineError::ServiceRequestInvalid(_)));
    assert_eq!(*harness.critic.calls.lock(), 0);
}

#[tokio::test(start_paused = true)]
async fn budget_expiry_aborts_execution() {
    let harness = Harness::new(
        StubGenerator::new().slow(Duration::from_secs(120)),
        ScriptedCritic::passing(),
    );
    let mut settings = harness.settings();
    settings.budget = Duration::from_secs(5);
    let pipeline = harness.pipeline_with(
        vec![StagePlan::required("content", Rubric::default())],
        ExtractionStage::default(),
        settings,
    );

    let failure = pipeline.execute(lesson(1)).await.unwrap_err();

    assert!(matches!(failure.error, PipelineError::GenerationTimeout(_)));
    assert!(pipeline
        .versions()
        .find_current(&NaturalKey::new("acme", "lesson", 1))
        .unwrap()
        .is_none());
}
