//! Document store
//!
//! Records are flat string key/value maps with a store-assigned id. The typed
//! [`VersionRecord`] view reads and writes the fields the pipeline relies on.

pub mod persistence;

pub use persistence::SledDocumentStore;

use crate::error::StorageError;
use crate::types::{DocVersion, NaturalKey, RecordId, RecordStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Fields = BTreeMap<String, String>;

pub const FIELD_NATURAL_KEY: &str = "natural_key";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_STORAGE: &str = "storage_field";
pub const FIELD_LEVEL: &str = "level";
pub const FIELD_PARENT_ID: &str = "parent_id";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: Fields,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }
}

/// Pending force-replace, written before the old record is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementEntry {
    pub old_record_id: RecordId,
    pub natural_key: NaturalKey,
    pub dependents: Vec<RecordId>,
    pub started_at: DateTime<Utc>,
}

/// Document store interface
pub trait DocumentStore: Send + Sync {
    /// All records whose natural key matches, including deleted ones.
    fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Vec<Record>, StorageError>;
    fn get(&self, id: &str) -> Result<Option<Record>, StorageError>;
    fn create(&self, fields: Fields) -> Result<RecordId, StorageError>;
    /// Merge `fields` into an existing record.
    fn update(&self, id: &str, fields: Fields) -> Result<(), StorageError>;
    fn delete(&self, id: &str) -> Result<(), StorageError>;
    /// Records whose `parent_id` field is `id`.
    fn find_dependents(&self, id: &str) -> Result<Vec<Record>, StorageError>;
    fn list(&self) -> Result<Vec<Record>, StorageError>;

    fn put_replacement(&self, entry: &ReplacementEntry) -> Result<(), StorageError>;
    fn pending_replacements(&self) -> Result<Vec<ReplacementEntry>, StorageError>;
    fn clear_replacement(&self, old_record_id: &str) -> Result<(), StorageError>;
}

/// Typed view over a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub record_id: RecordId,
    pub natural_key: NaturalKey,
    pub version: DocVersion,
    pub status: RecordStatus,
    pub storage_field: String,
    pub level: Option<String>,
    pub parent_id: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn required<'a>(record: &'a Record, name: &str) -> Result<&'a str, StorageError> {
    record.field(name).ok_or_else(|| {
        StorageError::InvalidRecord(format!("record {} is missing field '{}'", record.id, name))
    })
}

fn parse_time(record: &Record, name: &str) -> Result<DateTime<Utc>, StorageError> {
    let raw = required(record, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            StorageError::InvalidRecord(format!("record {} has bad {}: {}", record.id, name, e))
        })
}

impl VersionRecord {
    pub fn from_record(record: &Record) -> Result<Self, StorageError> {
        let invalid = |msg: String| StorageError::InvalidRecord(format!("record {}: {}", record.id, msg));
        let natural_key: NaturalKey = required(record, FIELD_NATURAL_KEY)?
            .parse()
            .map_err(|e: crate::error::PipelineError| invalid(e.to_string()))?;
        let version: DocVersion = required(record, FIELD_VERSION)?.parse().map_err(invalid)?;
        let status: RecordStatus = required(record, FIELD_STATUS)?.parse().map_err(invalid)?;
        Ok(Self {
            record_id: record.id.clone(),
            natural_key,
            version,
            status,
            storage_field: required(record, FIELD_STORAGE)?.to_string(),
            level: record.field(FIELD_LEVEL).map(str::to_string),
            parent_id: record.field(FIELD_PARENT_ID).map(str::to_string),
            created_at: parse_time(record, FIELD_CREATED_AT)?,
            updated_at: parse_time(record, FIELD_UPDATED_AT)?,
        })
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_NATURAL_KEY.to_string(), self.natural_key.to_string());
        fields.insert(FIELD_VERSION.to_string(), self.version.to_string());
        fields.insert(FIELD_STATUS.to_string(), self.status.to_string());
        fields.insert(FIELD_STORAGE.to_string(), self.storage_field.clone());
        if let Some(level) = &self.level {
            fields.insert(FIELD_LEVEL.to_string(), level.clone());
        }
        if let Some(parent_id) = &self.parent_id {
            fields.insert(FIELD_PARENT_ID.to_string(), parent_id.clone());
        }
        fields.insert(FIELD_CREATED_AT.to_string(), self.created_at.to_rfc3339());
        fields.insert(FIELD_UPDATED_AT.to_string(), self.updated_at.to_rfc3339());
        fields
    }

    pub fn is_live(&self) -> bool {
        self.status != RecordStatus::Deleted
    }
}
