//! Trimmer: drops reconstructible authoring aids from a document.
//!
//! Trimmed fields: entry `guidance`, `commentary`, `rationale`, `hints`, and
//! every metadata key starting with [`TRIMMABLE_METADATA_PREFIX`], either at
//! the top level or directly under a stage name (`{stage}.note.*`).

use crate::document::{AggregateDocument, Entry};

/// Metadata keys with this prefix are commentary and can be dropped.
pub const TRIMMABLE_METADATA_PREFIX: &str = "note.";

/// Return a copy of `doc` without its trimmable fields.
pub fn trim(doc: &AggregateDocument) -> AggregateDocument {
    let mut trimmed = doc.clone();
    for entry in &mut trimmed.entries {
        trim_entry(entry);
    }
    trimmed
        .metadata
        .retain(|key, _| !is_trimmable_key(key));
    trimmed
}

fn is_trimmable_key(key: &str) -> bool {
    key.starts_with(TRIMMABLE_METADATA_PREFIX)
        || key
            .split_once('.')
            .is_some_and(|(_, rest)| rest.starts_with(TRIMMABLE_METADATA_PREFIX))
}

fn trim_entry(entry: &mut Entry) {
    entry.guidance = None;
    entry.commentary = None;
    entry.rationale = None;
    entry.hints.clear();
}

/// Whether `trim` would change anything.
pub fn has_trimmable_fields(doc: &AggregateDocument) -> bool {
    doc.entries.iter().any(|e| {
        e.guidance.is_some() || e.commentary.is_some() || e.rationale.is_some() || !e.hints.is_empty()
    }) || doc
        .metadata
        .keys()
        .any(|key| is_trimmable_key(key))
}
