//! Generation and critique capabilities
//!
//! Both external services are opaque to the pipeline and modelled as traits.
//! The HTTP clients speak a small JSON protocol; tests use stub implementations.

use crate::critic::{CriticResult, Rubric};
use crate::document::Artifact;
use crate::error::PipelineError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Canonical input context for one generation, keyed by source name.
pub type GenerationContext = BTreeMap<String, Vec<u8>>;

/// Context key under which prior critic feedback is appended on retries.
pub const FEEDBACK_CONTEXT_KEY: &str = "critic_feedback";

#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Produce a draft artifact for `stage`. `feedback` is set on retries.
    async fn generate(
        &self,
        stage: &str,
        context: &GenerationContext,
        feedback: Option<&[String]>,
    ) -> Result<Artifact, PipelineError>;
}

#[async_trait]
pub trait CritiqueCapability: Send + Sync {
    async fn critique(
        &self,
        artifact: &Artifact,
        rubric: &Rubric,
    ) -> Result<CriticResult, PipelineError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    stage: &'a str,
    /// Context values, base64 encoded
    context: BTreeMap<&'a str, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a [String]>,
}

#[derive(Serialize)]
struct CritiqueRequest<'a> {
    artifact: &'a Artifact,
    rubric: &'a Rubric,
}

#[derive(Deserialize)]
struct CritiqueResponse {
    dimension_scores: BTreeMap<String, f64>,
    #[serde(default)]
    overall_pass: bool,
    #[serde(default)]
    feedback: Vec<String>,
    #[serde(default)]
    cost: f64,
}

/// Which service a failed call belongs to, for error classification.
#[derive(Debug, Clone, Copy)]
enum Service {
    Generation,
    Critique,
}

impl Service {
    fn transient(self, message: String) -> PipelineError {
        match self {
            Service::Generation => PipelineError::GenerationService(message),
            Service::Critique => PipelineError::CritiqueService(message),
        }
    }
}

fn map_http_error(service: Service, error: reqwest::Error) -> PipelineError {
    if let Some(status) = error.status() {
        return map_status(service, status.as_u16(), error.to_string());
    }
    // Timeouts, connection resets and body decode failures
    service.transient(format!("Request failed: {}", error))
}

fn map_status(service: Service, status: u16, detail: String) -> PipelineError {
    match status {
        408 | 429 | 500..=599 => service.transient(format!("HTTP {}: {}", status, detail)),
        _ => PipelineError::ServiceRequestInvalid(format!("HTTP {}: {}", status, detail)),
    }
}

fn build_client(timeout: Duration) -> Result<Client, PipelineError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// Generation service over HTTP: `POST {endpoint}` with a JSON body.
pub struct HttpGenerationClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl GenerationCapability for HttpGenerationClient {
    async fn generate(
        &self,
        stage: &str,
        context: &GenerationContext,
        feedback: Option<&[String]>,
    ) -> Result<Artifact, PipelineError> {
        let body = GenerateRequest {
            stage,
            context: context
                .iter()
                .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
                .collect(),
            feedback,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_http_error(Service::Generation, e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(map_status(Service::Generation, status.as_u16(), detail));
        }
        let mut artifact: Artifact = response
            .json()
            .await
            .map_err(|e| map_http_error(Service::Generation, e))?;
        if artifact.stage.is_empty() {
            artifact.stage = stage.to_string();
        }
        Ok(artifact)
    }
}

/// Critique service over HTTP: `POST {endpoint}` with artifact and rubric.
pub struct HttpCritiqueClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCritiqueClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CritiqueCapability for HttpCritiqueClient {
    async fn critique(
        &self,
        artifact: &Artifact,
        rubric: &Rubric,
    ) -> Result<CriticResult, PipelineError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&CritiqueRequest { artifact, rubric });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_http_error(Service::Critique, e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(map_status(Service::Critique, status.as_u16(), detail));
        }
        let parsed: CritiqueResponse = response
            .json()
            .await
            .map_err(|e| map_http_error(Service::Critique, e))?;
        let mut result = rubric.judge(parsed.dimension_scores, parsed.feedback, parsed.cost);
        // Keep the service's claim so the retry controller can log disagreement
        result.overall_pass = parsed.overall_pass;
        Ok(result)
    }
}
