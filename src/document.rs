//! Document schema
//!
//! Artifacts are the output of one generation attempt; the aggregate document is
//! what gets persisted. Maps are `BTreeMap` so serialization is deterministic.

use crate::types::{DocVersion, NaturalKey, RecordStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Structural role of an entry inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Opening,
    Body,
    Practice,
    Terminal,
}

/// One entry of a document.
///
/// `guidance`, `commentary`, `rationale` and `hints` are reconstructible
/// authoring aids; downstream consumers only need `order`, `kind`, `title`
/// and `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub order: u32,
    pub kind: EntryKind,
    pub title: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl Entry {
    pub fn new(order: u32, kind: EntryKind, title: impl Into<String>, content: Value) -> Self {
        Self {
            order,
            kind,
            title: title.into(),
            content,
            guidance: None,
            commentary: None,
            rationale: None,
            hints: Vec::new(),
        }
    }
}

/// Output of a single generation attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: String,
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Cost reported by the generation service for this attempt.
    #[serde(default)]
    pub cost: f64,
}

/// Fully assembled and cross-validated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDocument {
    pub natural_key: NaturalKey,
    pub version: DocVersion,
    pub status: RecordStatus,
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AggregateDocument {
    pub fn entry_count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
