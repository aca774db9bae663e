//! Shared stubs and harness for pipeline integration tests

use async_trait::async_trait;
use docforge::blob::MemoryBlobStore;
use docforge::capability::{CritiqueCapability, GenerationCapability, GenerationContext};
use docforge::critic::{CriticResult, Rubric};
use docforge::document::{Artifact, Entry, EntryKind};
use docforge::extraction::ExtractionStage;
use docforge::pipeline::{Pipeline, PipelineSettings};
use docforge::retry::backoff::BackoffPolicy;
use docforge::retry::StagePlan;
use docforge::store::SledDocumentStore;
use docforge::workspace::RetentionPolicy;
use docforge::PipelineError;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const GENERATION_COST: f64 = 0.10;
pub const CRITIQUE_COST: f64 = 0.01;

/// Incompressible text: hex of a BLAKE3 XOF stream.
pub fn noise(seed: &str, len: usize) -> String {
    let mut out = vec![0u8; len / 2 + 1];
    blake3::Hasher::new()
        .update(seed.as_bytes())
        .finalize_xof()
        .fill(&mut out);
    let mut text = hex::encode(out);
    text.truncate(len);
    text
}

/// One recorded generation call.
#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub stage: String,
    pub context: GenerationContext,
    pub feedback: Option<Vec<String>>,
}

/// Generator that numbers its entries after the artifacts already accepted
/// (visible in the context as `stage.<name>`).
pub struct StubGenerator {
    pub calls: Mutex<Vec<GenerateCall>>,
    kinds: HashMap<String, Vec<EntryKind>>,
    content_len: usize,
    guidance_len: usize,
    delay: Option<Duration>,
}

impl StubGenerator {
    /// Single "content" stage producing opening, body, practice and terminal entries.
    pub fn new() -> Self {
        Self::with_stages(&[(
            "content",
            &[
                EntryKind::Opening,
                EntryKind::Body,
                EntryKind::Practice,
                EntryKind::Terminal,
            ],
        )])
    }

    pub fn with_stages(stages: &[(&str, &[EntryKind])]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            kinds: stages
                .iter()
                .map(|(name, kinds)| (name.to_string(), kinds.to_vec()))
                .collect(),
            content_len: 200,
            guidance_len: 0,
            delay: None,
        }
    }

    /// Per-entry content and guidance sizes, in characters.
    pub fn sized(mut self, content_len: usize, guidance_len: usize) -> Self {
        self.content_len = content_len;
        self.guidance_len = guidance_len;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn accepted_entries(context: &GenerationContext) -> u32 {
    context
        .iter()
        .filter(|(key, _)| key.starts_with("stage."))
        .filter_map(|(_, bytes)| serde_json::from_slice::<Artifact>(bytes).ok())
        .map(|artifact| artifact.entries.len() as u32)
        .sum()
}

#[async_trait]
impl GenerationCapability for StubGenerator {
    async fn generate(
        &self,
        stage: &str,
        context: &GenerationContext,
        feedback: Option<&[String]>,
    ) -> Result<Artifact, PipelineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(params) = context.get("parameters") {
            let params: serde_json::Value = serde_json::from_slice(params).unwrap();
            if params.get("reject_request").and_then(|v| v.as_bool()) == Some(true) {
                return Err(PipelineError::ServiceRequestInvalid("HTTP 400: bad request".into()));
            }
        }
        self.calls.lock().push(GenerateCall {
            stage: stage.to_string(),
            context: context.clone(),
            feedback: feedback.map(|f| f.to_vec()),
        });

        let first = accepted_entries(context) + 1;
        let kinds = self.kinds.get(stage).cloned().unwrap_or_default();
        let entries = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| {
                let order = first + i as u32;
                let seed = format!("{}-{}", stage, order);
                let mut entry = Entry::new(
                    order,
                    kind,
                    format!("{} {}", stage, order),
                    json!({ "text": noise(&seed, self.content_len) }),
                );
                if self.guidance_len > 0 {
                    entry.guidance = Some(noise(&format!("{}-guidance", seed), self.guidance_len));
                    entry.hints = vec![format!("hint for {}", order)];
                }
                entry
            })
            .collect();
        let mut metadata = BTreeMap::new();
        metadata.insert("model".to_string(), "stub-1".to_string());
        metadata.insert("note.prompt".to_string(), format!("prompt for {}", stage));
        Ok(Artifact {
            stage: stage.to_string(),
            entries,
            metadata,
            cost: GENERATION_COST,
        })
    }
}

/// Critic scoring `coverage` from a per-stage script; accuracy and clarity always pass.
/// An exhausted script scores 0.95, a stage in `always_fail` scores 0.5.
pub struct ScriptedCritic {
    scripts: Mutex<HashMap<String, VecDeque<f64>>>,
    always_fail: HashSet<String>,
    pub calls: Mutex<usize>,
}

impl ScriptedCritic {
    pub fn passing() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            always_fail: HashSet::new(),
            calls: Mutex::new(0),
        }
    }

    pub fn script(self, stage: &str, coverage: &[f64]) -> Self {
        self.scripts
            .lock()
            .insert(stage.to_string(), coverage.iter().copied().collect());
        self
    }

    pub fn failing(mut self, stage: &str) -> Self {
        self.always_fail.insert(stage.to_string());
        self
    }
}

#[async_trait]
impl CritiqueCapability for ScriptedCritic {
    async fn critique(
        &self,
        artifact: &Artifact,
        rubric: &Rubric,
    ) -> Result<CriticResult, PipelineError> {
        *self.calls.lock() += 1;
        let coverage = if self.always_fail.contains(&artifact.stage) {
            0.5
        } else {
            self.scripts
                .lock()
                .get_mut(&artifact.stage)
                .and_then(|script| script.pop_front())
                .unwrap_or(0.95)
        };
        let mut scores = BTreeMap::new();
        scores.insert("coverage".to_string(), coverage);
        scores.insert("accuracy".to_string(), 0.95);
        scores.insert("clarity".to_string(), 0.90);
        let feedback = if coverage < 0.9 {
            vec![format!("coverage {:.2} is below 0.90", coverage)]
        } else {
            Vec::new()
        };
        Ok(rubric.judge(scores, feedback, CRITIQUE_COST))
    }
}

/// Temp-dir backed store, in-memory blobs and stub capabilities.
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<SledDocumentStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub generator: Arc<StubGenerator>,
    pub critic: Arc<ScriptedCritic>,
}

impl Harness {
    pub fn new(generator: StubGenerator, critic: ScriptedCritic) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SledDocumentStore::new(temp.path().join("store")).unwrap());
        Self {
            temp,
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            generator: Arc::new(generator),
            critic: Arc::new(critic),
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp.path().join("workspaces")
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            workspace_root: Some(self.workspace_root()),
            retention: RetentionPolicy::OnFailure,
            budget: Duration::from_secs(60),
            backoff: BackoffPolicy::immediate(3),
            ..Default::default()
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(
            vec![StagePlan::required("content", Rubric::default())],
            ExtractionStage::default(),
            self.settings(),
        )
    }

    pub fn pipeline_with(
        &self,
        stages: Vec<StagePlan>,
        extraction: ExtractionStage,
        settings: PipelineSettings,
    ) -> Pipeline {
        Pipeline::builder(
            self.store.clone(),
            self.blobs.clone(),
            self.generator.clone(),
            self.critic.clone(),
        )
        .stages(stages)
        .extraction(extraction)
        .settings(settings)
        .build()
        .unwrap()
    }
}
