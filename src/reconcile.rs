//! Reconciliation pass
//!
//! Cleans up what interrupted executions leave behind: force replaces that
//! stopped before their dependents were re-pointed, dependents whose parent is
//! gone, and blobs no record references. Run it while no execution is in
//! flight; a blob uploaded but not yet upserted looks orphaned.

use crate::blob::BlobStore;
use crate::error::PipelineError;
use crate::storage::StoredField;
use crate::store::{DocumentStore, FIELD_PARENT_ID, FIELD_STORAGE};
use crate::types::{BlobId, RecordId};
use crate::versioning::{relink, VersionManager};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    /// Journal entries completed (old record ids)
    pub replayed: Vec<RecordId>,
    /// Dependents re-pointed while replaying
    pub relinked: Vec<RecordId>,
    /// Journal entries whose key has no current record yet
    pub unresolved: Vec<RecordId>,
    /// Records whose parent_id names a record that does not exist
    pub dangling: Vec<RecordId>,
    pub orphan_blobs: Vec<BlobId>,
    pub deleted_blobs: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.replayed.is_empty()
            && self.unresolved.is_empty()
            && self.dangling.is_empty()
            && self.orphan_blobs.is_empty()
    }
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// With `dry_run` nothing is written; the report shows what would change.
    pub fn run(&self, dry_run: bool) -> Result<ReconcileReport, PipelineError> {
        let mut report = ReconcileReport {
            dry_run,
            ..Default::default()
        };
        self.replay_replacements(dry_run, &mut report)?;
        self.find_dangling(&mut report)?;
        self.collect_orphan_blobs(dry_run, &mut report)?;
        info!(
            dry_run,
            replayed = report.replayed.len(),
            relinked = report.relinked.len(),
            unresolved = report.unresolved.len(),
            dangling = report.dangling.len(),
            orphan_blobs = report.orphan_blobs.len(),
            deleted_blobs = report.deleted_blobs,
            "Reconciliation finished"
        );
        Ok(report)
    }

    fn replay_replacements(
        &self,
        dry_run: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), PipelineError> {
        let versions = VersionManager::new(Arc::clone(&self.store));
        for entry in self.store.pending_replacements()? {
            let Some(current) = versions.find_current(&entry.natural_key)? else {
                warn!(
                    old_record_id = %entry.old_record_id,
                    natural_key = %entry.natural_key,
                    "Replacement has no current record to point dependents at"
                );
                report.unresolved.push(entry.old_record_id.clone());
                continue;
            };
            for dependent in &entry.dependents {
                let Some(record) = self.store.get(dependent)? else {
                    continue;
                };
                if record.field(FIELD_PARENT_ID) == Some(entry.old_record_id.as_str()) {
                    if !dry_run {
                        relink(self.store.as_ref(), dependent, &current.record_id)?;
                    }
                    report.relinked.push(dependent.clone());
                }
            }
            if !dry_run {
                self.store.clear_replacement(&entry.old_record_id)?;
            }
            report.replayed.push(entry.old_record_id);
        }
        Ok(())
    }

    fn find_dangling(&self, report: &mut ReconcileReport) -> Result<(), PipelineError> {
        let records = self.store.list()?;
        let ids: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        for record in &records {
            if let Some(parent) = record.field(FIELD_PARENT_ID) {
                if !ids.contains(parent) && !report.relinked.contains(&record.id) {
                    report.dangling.push(record.id.clone());
                }
            }
        }
        Ok(())
    }

    fn collect_orphan_blobs(
        &self,
        dry_run: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), PipelineError> {
        let referenced: BTreeSet<String> = self
            .store
            .list()?
            .iter()
            .filter_map(|r| r.field(FIELD_STORAGE))
            .filter_map(|field| StoredField::parse(field).blob_id().map(str::to_string))
            .collect();

        for blob_id in self.blobs.list()? {
            if referenced.contains(&blob_id) {
                continue;
            }
            if !dry_run {
                self.blobs.delete(&blob_id)?;
                report.deleted_blobs += 1;
            }
            report.orphan_blobs.push(blob_id);
        }
        Ok(())
    }
}
