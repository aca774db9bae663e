//! Upsert and versioning against the document store
//!
//! A natural key has at most one current record: the highest version whose
//! status is not `deleted`. Upserts either create that record, update it in
//! place, or (with `force`) replace it and re-point its dependents.

use crate::error::PipelineError;
use crate::store::{
    DocumentStore, Fields, ReplacementEntry, VersionRecord, FIELD_LEVEL, FIELD_PARENT_ID,
    FIELD_STATUS, FIELD_STORAGE, FIELD_UPDATED_AT, FIELD_VERSION,
};
use crate::types::{DocVersion, NaturalKey, RecordId, RecordStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version change requested for an in-place update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    #[default]
    None,
    Minor,
    Major,
}

impl VersionBump {
    pub fn apply(self, version: DocVersion) -> DocVersion {
        match self {
            VersionBump::None => version,
            VersionBump::Minor => version.next_minor(),
            VersionBump::Major => version.next_major(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
    Replaced,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpsertAction::Created => "created",
            UpsertAction::Updated => "updated",
            UpsertAction::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertMetadata {
    pub version_bump: VersionBump,
    pub level: Option<String>,
    pub parent_id: Option<RecordId>,
    /// Overrides the status of an updated record; new records start as draft.
    pub status: Option<RecordStatus>,
}

/// What an upsert is going to do, computed before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionPlan {
    pub version: DocVersion,
    pub action: UpsertAction,
    pub status: RecordStatus,
    pub current: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub record_id: RecordId,
    pub version: DocVersion,
    pub action: UpsertAction,
    /// Dependents re-pointed at the new record by a force replace
    pub relinked: Vec<RecordId>,
}

pub struct VersionManager {
    store: Arc<dyn DocumentStore>,
}

impl VersionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Every record stored under `key`, deleted ones included, oldest version first.
    pub fn history(&self, key: &NaturalKey) -> Result<Vec<VersionRecord>, PipelineError> {
        let mut records = self
            .store
            .find_by_natural_key(key)?
            .iter()
            .map(VersionRecord::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(records)
    }

    /// The current record for `key`, if any.
    ///
    /// Fails with `UpsertConflict` when several live records share the highest version.
    pub fn find_current(&self, key: &NaturalKey) -> Result<Option<VersionRecord>, PipelineError> {
        let live: Vec<VersionRecord> = self
            .history(key)?
            .into_iter()
            .filter(VersionRecord::is_live)
            .collect();
        let Some(top) = live.iter().map(|r| r.version).max() else {
            return Ok(None);
        };
        let mut current: Vec<VersionRecord> =
            live.into_iter().filter(|r| r.version == top).collect();
        if current.len() > 1 {
            return Err(PipelineError::UpsertConflict {
                natural_key: key.to_string(),
                record_ids: current.into_iter().map(|r| r.record_id).collect(),
            });
        }
        Ok(current.pop())
    }

    pub fn plan(
        &self,
        key: &NaturalKey,
        force: bool,
        bump: VersionBump,
    ) -> Result<VersionPlan, PipelineError> {
        let plan = match self.find_current(key)? {
            None => VersionPlan {
                version: DocVersion::INITIAL,
                action: UpsertAction::Created,
                status: RecordStatus::Draft,
                current: None,
            },
            Some(current) if force => VersionPlan {
                version: DocVersion {
                    major: current.version.major + 1,
                    minor: 0,
                },
                action: UpsertAction::Replaced,
                status: RecordStatus::Draft,
                current: Some(current.record_id),
            },
            Some(current) => VersionPlan {
                version: bump.apply(current.version),
                action: UpsertAction::Updated,
                status: current.status,
                current: Some(current.record_id),
            },
        };
        Ok(plan)
    }

    pub fn upsert(
        &self,
        key: &NaturalKey,
        storage_field: &str,
        metadata: &UpsertMetadata,
        force: bool,
    ) -> Result<UpsertOutcome, PipelineError> {
        let plan = self.plan(key, force, metadata.version_bump)?;
        let outcome = match (&plan.action, plan.current) {
            (UpsertAction::Updated, Some(current)) => {
                self.update_in_place(&current, plan.version, storage_field, metadata)?
            }
            (UpsertAction::Replaced, Some(current)) => {
                self.replace(key, &current, plan.version, storage_field, metadata)?
            }
            _ => {
                let record_id = self.create(key, plan.version, storage_field, metadata)?;
                UpsertOutcome {
                    record_id,
                    version: plan.version,
                    action: UpsertAction::Created,
                    relinked: Vec::new(),
                }
            }
        };
        info!(
            natural_key = %key,
            record_id = %outcome.record_id,
            version = %outcome.version,
            action = %outcome.action,
            "Upsert complete"
        );
        Ok(outcome)
    }

    fn create(
        &self,
        key: &NaturalKey,
        version: DocVersion,
        storage_field: &str,
        metadata: &UpsertMetadata,
    ) -> Result<RecordId, PipelineError> {
        let now = Utc::now();
        let record = VersionRecord {
            record_id: RecordId::new(),
            natural_key: key.clone(),
            version,
            status: RecordStatus::Draft,
            storage_field: storage_field.to_string(),
            level: metadata.level.clone(),
            parent_id: metadata.parent_id.clone(),
            created_at: now,
            updated_at: now,
        };
        Ok(self.store.create(record.to_fields())?)
    }

    fn update_in_place(
        &self,
        record_id: &str,
        version: DocVersion,
        storage_field: &str,
        metadata: &UpsertMetadata,
    ) -> Result<UpsertOutcome, PipelineError> {
        let mut fields = Fields::new();
        fields.insert(FIELD_STORAGE.to_string(), storage_field.to_string());
        fields.insert(FIELD_VERSION.to_string(), version.to_string());
        fields.insert(FIELD_UPDATED_AT.to_string(), Utc::now().to_rfc3339());
        if let Some(level) = &metadata.level {
            fields.insert(FIELD_LEVEL.to_string(), level.clone());
        }
        if let Some(parent_id) = &metadata.parent_id {
            fields.insert(FIELD_PARENT_ID.to_string(), parent_id.clone());
        }
        if let Some(status) = metadata.status {
            fields.insert(FIELD_STATUS.to_string(), status.to_string());
        }
        self.store.update(record_id, fields)?;
        debug!(record_id, version = %version, "Record updated in place");
        Ok(UpsertOutcome {
            record_id: record_id.to_string(),
            version,
            action: UpsertAction::Updated,
            relinked: Vec::new(),
        })
    }

    fn replace(
        &self,
        key: &NaturalKey,
        old_id: &str,
        version: DocVersion,
        storage_field: &str,
        metadata: &UpsertMetadata,
    ) -> Result<UpsertOutcome, PipelineError> {
        let dependents: Vec<RecordId> = self
            .store
            .find_dependents(old_id)?
            .into_iter()
            .map(|r| r.id)
            .collect();

        // The journal entry outlives a crash between delete and relink
        self.store.put_replacement(&ReplacementEntry {
            old_record_id: old_id.to_string(),
            natural_key: key.clone(),
            dependents: dependents.clone(),
            started_at: Utc::now(),
        })?;

        self.store.delete(old_id)?;
        let new_id = self.create(key, version, storage_field, metadata)?;

        let mut relinked = Vec::with_capacity(dependents.len());
        let mut pending = Vec::new();
        for dependent in &dependents {
            match relink(self.store.as_ref(), dependent, &new_id) {
                Ok(()) => relinked.push(dependent.clone()),
                Err(e) => {
                    warn!(
                        dependent = %dependent,
                        new_record_id = %new_id,
                        error = %e,
                        "Failed to re-point dependent"
                    );
                    pending.push(dependent.clone());
                }
            }
        }
        if !pending.is_empty() {
            // Journal entry stays so reconcile can finish the relink
            return Err(PipelineError::ReplaceIncomplete {
                natural_key: key.to_string(),
                new_record_id: new_id,
                pending,
            });
        }

        self.store.clear_replacement(old_id)?;
        info!(
            natural_key = %key,
            old_record_id = old_id,
            new_record_id = %new_id,
            relinked = relinked.len(),
            "Record force-replaced"
        );
        Ok(UpsertOutcome {
            record_id: new_id,
            version,
            action: UpsertAction::Replaced,
            relinked,
        })
    }
}

/// Point `dependent`'s `parent_id` at `new_parent`.
pub(crate) fn relink(
    store: &dyn DocumentStore,
    dependent: &str,
    new_parent: &str,
) -> Result<(), PipelineError> {
    let mut fields = Fields::new();
    fields.insert(FIELD_PARENT_ID.to_string(), new_parent.to_string());
    fields.insert(FIELD_UPDATED_AT.to_string(), Utc::now().to_rfc3339());
    store.update(dependent, fields)?;
    Ok(())
}
