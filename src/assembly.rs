//! Assembler: merges accepted artifacts into one aggregate document and checks
//! the cross-entry invariants before anything is persisted.

use crate::document::{AggregateDocument, Artifact, EntryKind};
use crate::error::PipelineError;
use crate::types::{DocVersion, NaturalKey, RecordStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count and type-distribution limits for an aggregate document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRules {
    #[serde(default = "default_min_entries")]
    pub min_entries: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_min_entries() -> usize {
    1
}

fn default_max_entries() -> usize {
    64
}

impl Default for AssemblyRules {
    fn default() -> Self {
        Self {
            min_entries: default_min_entries(),
            max_entries: default_max_entries(),
        }
    }
}

/// Document-level metadata supplied by the caller.
#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub natural_key: NaturalKey,
    pub version: DocVersion,
    pub status: RecordStatus,
    pub fields: BTreeMap<String, String>,
}

/// Concatenate the artifacts' entries in the given order and validate the result.
///
/// Artifact metadata is carried over as `{stage}.{key}`. On failure every
/// violated invariant is reported, not only the first.
pub fn assemble(
    artifacts: &[Artifact],
    metadata: DocumentMetadata,
    rules: &AssemblyRules,
) -> Result<AggregateDocument, PipelineError> {
    let entries: Vec<_> = artifacts
        .iter()
        .flat_map(|artifact| artifact.entries.iter().cloned())
        .collect();

    let mut doc_metadata = metadata.fields;
    for artifact in artifacts {
        for (key, value) in &artifact.metadata {
            doc_metadata.insert(format!("{}.{}", artifact.stage, key), value.clone());
        }
    }

    let document = AggregateDocument {
        natural_key: metadata.natural_key,
        version: metadata.version,
        status: metadata.status,
        entries,
        metadata: doc_metadata,
    };

    let violations = validate(&document, rules);
    if violations.is_empty() {
        Ok(document)
    } else {
        Err(PipelineError::StructuralValidation(violations))
    }
}

/// Check ordering, count and type-distribution invariants.
pub fn validate(document: &AggregateDocument, rules: &AssemblyRules) -> Vec<String> {
    let mut violations = Vec::new();
    let entries = &document.entries;

    if entries.len() < rules.min_entries {
        violations.push(format!(
            "document has {} entries, at least {} required",
            entries.len(),
            rules.min_entries
        ));
    }
    if entries.len() > rules.max_entries {
        violations.push(format!(
            "document has {} entries, at most {} allowed",
            entries.len(),
            rules.max_entries
        ));
    }

    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u32 + 1;
        if entry.order != expected {
            violations.push(format!(
                "entry at position {} has order {}, expected {}",
                expected, entry.order, expected
            ));
        }
        if entry.title.trim().is_empty() {
            violations.push(format!("entry {} has an empty title", expected));
        }
    }

    let terminals: Vec<usize> = positions(document, EntryKind::Terminal);
    match terminals.as_slice() {
        [] => violations.push("document has no terminal entry".to_string()),
        [position] => {
            if *position + 1 != entries.len() {
                violations.push(format!(
                    "terminal entry is at position {}, must be last",
                    position + 1
                ));
            }
        }
        many => violations.push(format!(
            "document has {} terminal entries, exactly one allowed",
            many.len()
        )),
    }

    let openings = positions(document, EntryKind::Opening);
    if openings.len() > 1 {
        violations.push(format!(
            "document has {} opening entries, at most one allowed",
            openings.len()
        ));
    }
    if let Some(position) = openings.iter().find(|p| **p != 0) {
        violations.push(format!(
            "opening entry is at position {}, must be first",
            position + 1
        ));
    }

    violations
}

fn positions(document: &AggregateDocument, kind: EntryKind) -> Vec<usize> {
    document
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == kind)
        .map(|(i, _)| i)
        .collect()
}
