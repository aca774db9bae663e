//! Batch executions and repair of interrupted replacements.

use super::support::{Harness, ScriptedCritic, StubGenerator};
use docforge::blob::BlobStore;
use docforge::reconcile::Reconciler;
use docforge::store::{DocumentStore, ReplacementEntry};
use docforge::{NaturalKey, PipelineError, PipelineRequest};
use chrono::Utc;
use std::sync::Arc;

fn request(kind: &str, order: u32) -> PipelineRequest {
    PipelineRequest::new(NaturalKey::new("acme", kind, order))
}

fn reconciler(harness: &Harness) -> Reconciler {
    Reconciler::new(harness.store.clone(), harness.blobs.clone())
}

#[tokio::test]
async fn batch_collects_successes_and_failures() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline();
    let mut bad = request("quiz", 1);
    bad.generation_parameters = serde_json::json!({ "reject_request": true });
    let requests = vec![
        request("lesson", 1),
        request("lesson", 2),
        bad,
        request("lesson", 3),
    ];

    let outcome = pipeline.execute_batch(requests, 2).await;

    assert_eq!(outcome.successes.len(), 3);
    assert_eq!(outcome.failures.len(), 1);
    let failed = &outcome.failures[0];
    assert_eq!(failed.natural_key, NaturalKey::new("acme", "quiz", 1));
    assert!(matches!(
        failed.failure.error,
        PipelineError::ServiceRequestInvalid(_)
    ));

    let mut ids: Vec<_> = outcome.successes.iter().map(|r| &r.execution_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    for order in 1..=3 {
        assert!(pipeline
            .versions()
            .find_current(&NaturalKey::new("acme", "lesson", order))
            .unwrap()
            .is_some());
    }
}

#[tokio::test]
async fn empty_batch_is_empty_outcome() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let outcome = harness.pipeline().execute_batch(Vec::new(), 4).await;
    assert!(outcome.successes.is_empty());
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn clean_store_reconciles_to_nothing() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    harness.pipeline().execute(request("lesson", 1)).await.unwrap();

    let report = reconciler(&harness).run(false).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.deleted_blobs, 0);
}

#[tokio::test]
async fn replaced_blob_document_leaves_an_orphan_until_reconciled() {
    let harness = Harness::new(
        StubGenerator::new().sized(60_000, 0),
        ScriptedCritic::passing(),
    );
    let pipeline = harness.pipeline();
    pipeline.execute(request("lesson", 1)).await.unwrap();
    let mut force = request("lesson", 1);
    force.force = true;
    pipeline.execute(force).await.unwrap();
    assert_eq!(harness.blobs.len(), 2);

    let dry = reconciler(&harness).run(true).unwrap();
    assert_eq!(dry.orphan_blobs.len(), 1);
    assert_eq!(dry.deleted_blobs, 0);
    assert_eq!(harness.blobs.len(), 2);

    let report = reconciler(&harness).run(false).unwrap();
    assert_eq!(report.orphan_blobs, dry.orphan_blobs);
    assert_eq!(report.deleted_blobs, 1);
    assert_eq!(harness.blobs.len(), 1);

    // The surviving blob still backs the current document
    let (_, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.version.to_string(), "2");
    assert!(reconciler(&harness).run(false).unwrap().is_clean());
}

#[tokio::test]
async fn interrupted_replacement_is_replayed() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let pipeline = harness.pipeline();
    let parent = pipeline.execute(request("lesson", 1)).await.unwrap();
    let mut child_request = request("quiz", 1);
    child_request.parent_id = Some(parent.record_id.clone());
    let child = pipeline.execute(child_request).await.unwrap();

    // A replacement that stopped after deleting the old record
    harness
        .store
        .put_replacement(&ReplacementEntry {
            old_record_id: parent.record_id.clone(),
            natural_key: NaturalKey::new("acme", "lesson", 1),
            dependents: vec![child.record_id.clone()],
            started_at: Utc::now(),
        })
        .unwrap();
    harness.store.delete(&parent.record_id).unwrap();

    let pending = reconciler(&harness).run(true).unwrap();
    assert_eq!(pending.unresolved, vec![parent.record_id.clone()]);
    assert_eq!(pending.dangling, vec![child.record_id.clone()]);

    let rebuilt = pipeline.execute(request("lesson", 1)).await.unwrap();
    let report = reconciler(&harness).run(false).unwrap();

    assert_eq!(report.replayed, vec![parent.record_id.clone()]);
    assert_eq!(report.relinked, vec![child.record_id.clone()]);
    assert!(report.dangling.is_empty());
    assert!(harness.store.pending_replacements().unwrap().is_empty());
    let child_record = harness.store.get(&child.record_id).unwrap().unwrap();
    assert_eq!(
        child_record.field("parent_id"),
        Some(rebuilt.record_id.as_str())
    );
}

#[tokio::test]
async fn unreferenced_blob_from_an_aborted_execution_is_removed() {
    let harness = Harness::new(StubGenerator::new(), ScriptedCritic::passing());
    let stray = harness.blobs.put(b"uploaded before the upsert failed").unwrap();
    let store: Arc<dyn DocumentStore> = harness.store.clone();

    let report = Reconciler::new(store, harness.blobs.clone()).run(false).unwrap();

    assert_eq!(report.orphan_blobs, vec![stray]);
    assert!(harness.blobs.is_empty());
}
