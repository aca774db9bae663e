//! CLI run context against an on-disk workspace.

use super::support::{ScriptedCritic, StubGenerator};
use docforge::blob::FsBlobStore;
use docforge::cli::{Commands, OutputFormat, RunContext};
use docforge::pipeline::Pipeline;
use docforge::store::SledDocumentStore;
use docforge::{NaturalKey, PipelineError, PipelineRequest, StorageError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const CONFIG: &str = r#"
[pipeline]
max_retries = 2
workspace_dir = "runs"

[storage]
store_path = "data/store"
blob_path = "data/blobs"
"#;

fn workspace_with_config(contents: &str) -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("docforge.toml");
    fs::write(&config_path, contents).unwrap();
    (temp, config_path)
}

async fn seed_document(root: &Path, key: NaturalKey) {
    let store = Arc::new(SledDocumentStore::new(root.join("data/store")).unwrap());
    let blobs = Arc::new(FsBlobStore::new(root.join("data/blobs")).unwrap());
    let pipeline = Pipeline::builder(
        store.clone(),
        blobs,
        Arc::new(StubGenerator::new()),
        Arc::new(ScriptedCritic::passing()),
    )
    .build()
    .unwrap();
    pipeline.execute(PipelineRequest::new(key)).await.unwrap();
    store.flush().unwrap();
}

#[tokio::test]
async fn configured_store_paths_are_created_under_the_workspace() {
    let (temp, config_path) = workspace_with_config(CONFIG);

    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    assert_eq!(context.config().pipeline.max_retries, 2);
    assert!(temp.path().join("data/store").exists());
    assert!(temp.path().join("data/blobs").exists());
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let (temp, config_path) = workspace_with_config("[pipeline]\nmax_retries = 0\n");

    let result = RunContext::new(temp.path().to_path_buf(), Some(config_path));

    match result {
        Err(PipelineError::ConfigError(message)) => assert!(message.contains("max_retries")),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("config with zero retries was accepted"),
    }
}

#[tokio::test]
async fn history_and_reconcile_on_an_empty_workspace() {
    let (temp, config_path) = workspace_with_config(CONFIG);
    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    let history = context
        .execute(&Commands::History {
            natural_key: "acme/lesson/1".to_string(),
            format: OutputFormat::Text,
        })
        .await
        .unwrap();
    assert_eq!(history, "No records.");

    let report = context
        .execute(&Commands::Reconcile {
            dry_run: true,
            format: OutputFormat::Json,
        })
        .await
        .unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["deleted_blobs"], 0);
}

#[tokio::test]
async fn load_of_unknown_key_is_record_not_found() {
    let (temp, config_path) = workspace_with_config(CONFIG);
    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    let result = context
        .execute(&Commands::Load {
            natural_key: "acme/lesson/9".to_string(),
        })
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::Storage(StorageError::RecordNotFound(_)))
    ));
}

#[tokio::test]
async fn malformed_natural_key_is_a_validation_error() {
    let (temp, config_path) = workspace_with_config(CONFIG);
    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    let result = context
        .execute(&Commands::History {
            natural_key: "acme/lesson".to_string(),
            format: OutputFormat::Text,
        })
        .await;

    assert!(matches!(result, Err(PipelineError::StructuralValidation(_))));
}

#[tokio::test]
async fn run_requires_service_endpoints() {
    let (temp, config_path) = workspace_with_config(CONFIG);
    let request_path = temp.path().join("request.json");
    fs::write(
        &request_path,
        r#"{"natural_key": {"owner": "acme", "kind": "lesson", "order": 1}}"#,
    )
    .unwrap();
    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    let result = context
        .execute(&Commands::Run {
            request: request_path,
            concurrency: None,
            format: OutputFormat::Text,
        })
        .await;

    match result {
        Err(PipelineError::ConfigError(message)) => assert!(message.contains("endpoint")),
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn stored_documents_are_visible_to_history_and_load() {
    let (temp, config_path) = workspace_with_config(CONFIG);
    seed_document(temp.path(), NaturalKey::new("acme", "lesson", 1)).await;
    let context = RunContext::new(temp.path().to_path_buf(), Some(config_path)).unwrap();

    let history = context
        .execute(&Commands::History {
            natural_key: "acme/lesson/1".to_string(),
            format: OutputFormat::Json,
        })
        .await
        .unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&history).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["version"], "1");
    assert_eq!(rows[0]["status"], "draft");

    let loaded = context
        .execute(&Commands::Load {
            natural_key: "acme/lesson/1".to_string(),
        })
        .await
        .unwrap();
    let document: serde_json::Value = serde_json::from_str(&loaded).unwrap();
    assert_eq!(document["entries"].as_array().unwrap().len(), 4);
}
