//! Inline versus blob placement of stored documents.

use super::support::{noise, Harness, ScriptedCritic, StubGenerator};
use docforge::blob::{BlobStore, MemoryBlobStore};
use docforge::codec;
use docforge::config::ForgeConfig;
use docforge::document::{AggregateDocument, Entry, EntryKind};
use docforge::retry::backoff::BackoffPolicy;
use docforge::storage::{StorageManager, StorageMode, StoredField};
use docforge::pipeline::Pipeline;
use docforge::{DocVersion, NaturalKey, PipelineError, PipelineRequest, RecordStatus};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const FIELD_LIMIT: usize = 100_000;

fn document(content_len: usize) -> AggregateDocument {
    AggregateDocument {
        natural_key: NaturalKey::new("acme", "lesson", 1),
        version: DocVersion::INITIAL,
        status: RecordStatus::Draft,
        entries: vec![
            Entry::new(1, EntryKind::Body, "body", json!({ "text": noise("body", content_len) })),
            Entry::new(2, EntryKind::Terminal, "end", json!("done")),
        ],
        metadata: BTreeMap::new(),
    }
}

fn manager() -> (Arc<MemoryBlobStore>, StorageManager) {
    let blobs = Arc::new(MemoryBlobStore::new());
    let manager = StorageManager::new(blobs.clone(), BackoffPolicy::immediate(3));
    (blobs, manager)
}

#[tokio::test]
async fn encoded_length_equal_to_limit_stays_inline() {
    let doc = document(2_000);
    let encoded_len = codec::encoded_len(&doc).unwrap();
    let (blobs, manager) = manager();

    let at_limit = manager.store(&doc, encoded_len).await.unwrap();
    assert_eq!(at_limit.mode(), StorageMode::Inline);
    assert_eq!(at_limit.encoded_len, encoded_len);
    assert!(blobs.is_empty());

    // Nothing to trim, so one byte less forces the blob path
    let below = manager.store(&doc, encoded_len - 1).await.unwrap();
    assert_eq!(below.mode(), StorageMode::Blob);
    assert_eq!(blobs.len(), 1);
}

#[tokio::test]
async fn default_limit_splits_small_and_large_documents() {
    let (blobs, manager) = manager();

    let small = manager.store(&document(10_000), FIELD_LIMIT).await.unwrap();
    assert_eq!(small.mode(), StorageMode::Inline);
    assert!(small.field.to_string().len() <= FIELD_LIMIT);

    let large = manager.store(&document(400_000), FIELD_LIMIT).await.unwrap();
    assert_eq!(large.mode(), StorageMode::Blob);
    let field = large.field.to_string();
    assert!(field.len() < 64);
    let blob_id = StoredField::parse(&field).blob_id().unwrap().to_string();
    assert!(blobs.get(&blob_id).unwrap().is_some());

    let loaded = manager.load(&field).await.unwrap();
    assert_eq!(loaded, document(400_000));
}

#[tokio::test]
async fn large_generated_document_goes_to_blob_store() {
    let harness = Harness::new(
        StubGenerator::new().sized(60_000, 0),
        ScriptedCritic::passing(),
    );
    let pipeline = harness.pipeline();

    let response = pipeline
        .execute(PipelineRequest::new(NaturalKey::new("acme", "lesson", 1)))
        .await
        .unwrap();

    assert_eq!(response.storage_mode, StorageMode::Blob);
    assert_eq!(harness.blobs.len(), 1);
    let (record, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();
    assert!(record.storage_field.starts_with("storage:"));
    assert_eq!(document.entries.len(), 4);
    let storage = response.metrics.stages.get("storage").unwrap();
    assert!(storage.bytes_in > FIELD_LIMIT as u64);
}

#[tokio::test]
async fn authoring_aids_are_trimmed_before_falling_back_to_blob() {
    let harness = Harness::new(
        StubGenerator::new().sized(200, 40_000),
        ScriptedCritic::passing(),
    );
    let pipeline = harness.pipeline();

    let response = pipeline
        .execute(PipelineRequest::new(NaturalKey::new("acme", "lesson", 1)))
        .await
        .unwrap();

    assert_eq!(response.storage_mode, StorageMode::Inline);
    assert!(response.trimmed);
    assert!(harness.blobs.is_empty());
    let (_, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.entries.len(), 4);
    assert!(document.entries.iter().all(|e| e.guidance.is_none()));
    assert!(document.entries.iter().all(|e| e.hints.is_empty()));
    assert_eq!(document.entries[0].title, "content 1");
}

#[tokio::test]
async fn stage_notes_are_dropped_with_the_other_aids() {
    let harness = Harness::new(
        StubGenerator::new().sized(200, 40_000),
        ScriptedCritic::passing(),
    );
    let pipeline = harness.pipeline();

    pipeline
        .execute(PipelineRequest::new(NaturalKey::new("acme", "lesson", 1)))
        .await
        .unwrap();

    let (_, document) = pipeline
        .load(&NaturalKey::new("acme", "lesson", 1))
        .await
        .unwrap()
        .unwrap();
    assert!(!document.metadata.contains_key("content.note.prompt"));
    assert_eq!(
        document.metadata.get("content.model").map(String::as_str),
        Some("stub-1")
    );
}

#[tokio::test]
async fn configured_limits_apply_when_request_leaves_them_unset() {
    let mut config = ForgeConfig::default();
    config.pipeline.field_limit = 1000;
    config.pipeline.max_retries = 1;

    let harness = Harness::new(StubGenerator::new().sized(2_000, 0), ScriptedCritic::passing());
    let pipeline = Pipeline::builder(
        harness.store.clone(),
        harness.blobs.clone(),
        harness.generator.clone(),
        harness.critic.clone(),
    )
    .with_config(&config, harness.temp.path())
    .build()
    .unwrap();
    let response = pipeline
        .execute(PipelineRequest::new(NaturalKey::new("acme", "lesson", 1)))
        .await
        .unwrap();
    assert_eq!(response.storage_mode, StorageMode::Blob);
    assert_eq!(harness.blobs.len(), 1);

    // An explicit request limit still wins over the configured one
    let mut request = PipelineRequest::new(NaturalKey::new("acme", "lesson", 2));
    request.field_limit = Some(FIELD_LIMIT);
    let response = pipeline.execute(request).await.unwrap();
    assert_eq!(response.storage_mode, StorageMode::Inline);

    let rejecting = Harness::new(
        StubGenerator::new(),
        ScriptedCritic::passing().failing("content"),
    );
    let pipeline = Pipeline::builder(
        rejecting.store.clone(),
        rejecting.blobs.clone(),
        rejecting.generator.clone(),
        rejecting.critic.clone(),
    )
    .with_config(&config, rejecting.temp.path())
    .build()
    .unwrap();
    let failure = pipeline
        .execute(PipelineRequest::new(NaturalKey::new("acme", "lesson", 1)))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::Rejected { ref history, .. } if history.len() == 1));
    assert_eq!(rejecting.generator.call_count(), 1);
}
