//! Core identity and version types shared across the pipeline.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned record identifier.
pub type RecordId = String;

/// Content-addressed blob identifier (20 lowercase hex chars).
pub type BlobId = String;

/// Length of every blob id handed out by a blob store.
pub const BLOB_ID_LEN: usize = 20;

/// Caller-supplied identity of a generated document: owner + kind + order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub owner: String,
    pub kind: String,
    pub order: u32,
}

impl NaturalKey {
    pub fn new(owner: impl Into<String>, kind: impl Into<String>, order: u32) -> Self {
        Self {
            owner: owner.into(),
            kind: kind.into(),
            order,
        }
    }

    /// Key of the document immediately before this one in the same sequence.
    pub fn predecessor(&self) -> Option<NaturalKey> {
        if self.order <= 1 {
            return None;
        }
        Some(NaturalKey::new(self.owner.clone(), self.kind.clone(), self.order - 1))
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        for (label, value) in [("owner", &self.owner), ("kind", &self.kind)] {
            if value.trim().is_empty() {
                problems.push(format!("natural key {} must not be empty", label));
            }
            if value.contains('/') {
                problems.push(format!("natural key {} must not contain '/'", label));
            }
        }
        if self.order == 0 {
            problems.push("natural key order must start at 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.kind, self.order)
    }
}

impl FromStr for NaturalKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [owner, kind, order] = parts.as_slice() else {
            return Err(PipelineError::StructuralValidation(vec![format!(
                "natural key '{}' must have the form owner/kind/order",
                s
            )]));
        };
        let order = order.parse::<u32>().map_err(|_| {
            PipelineError::StructuralValidation(vec![format!(
                "natural key '{}' has a non-numeric order",
                s
            )])
        })?;
        let key = NaturalKey::new(*owner, *kind, order);
        key.validate().map_err(PipelineError::StructuralValidation)?;
        Ok(key)
    }
}

/// Record lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Draft,
    Published,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "draft",
            RecordStatus::Published => "published",
            RecordStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RecordStatus::Draft),
            "published" => Ok(RecordStatus::Published),
            "deleted" => Ok(RecordStatus::Deleted),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// Document version: `major` or `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocVersion {
    pub major: u32,
    pub minor: u32,
}

impl DocVersion {
    pub const INITIAL: DocVersion = DocVersion { major: 1, minor: 0 };

    pub fn next_minor(self) -> Self {
        DocVersion {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    pub fn next_major(self) -> Self {
        DocVersion {
            major: self.major + 1,
            minor: 0,
        }
    }
}

impl fmt::Display for DocVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

impl FromStr for DocVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        let major = major
            .parse::<u32>()
            .map_err(|_| format!("invalid version '{}'", s))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|_| format!("invalid version '{}'", s))?;
        Ok(DocVersion { major, minor })
    }
}

/// Generate a unique execution id.
pub fn new_execution_id() -> String {
    format!("exec-{}", uuid::Uuid::new_v4().simple())
}
