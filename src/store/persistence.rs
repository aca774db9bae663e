//! Sled-backed document store

use crate::error::StorageError;
use crate::store::{
    DocumentStore, Fields, Record, ReplacementEntry, FIELD_NATURAL_KEY, FIELD_PARENT_ID,
};
use crate::types::{NaturalKey, RecordId};
use bincode;
use sled;
use std::path::Path;

const TREE_RECORDS: &str = "records";
const TREE_NATURAL_KEY_INDEX: &str = "idx_natural_key";
const TREE_PARENT_INDEX: &str = "idx_parent";
const TREE_REPLACEMENTS: &str = "replacements";

/// Sled implementation of [`DocumentStore`]
///
/// Secondary indexes map `{natural_key}\0{record_id}` and
/// `{parent_id}\0{record_id}` to nothing. Index entries are written after the
/// record and re-checked on read, so a stale entry never yields a wrong record.
pub struct SledDocumentStore {
    db: sled::Db,
    records: sled::Tree,
    by_natural_key: sled::Tree,
    by_parent: sled::Tree,
    replacements: sled::Tree,
}

fn to_storage_io(e: sled::Error) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("sled error: {}", e),
    ))
}

fn to_storage_data<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("Failed to (de)serialize record: {}", e),
    ))
}

fn index_key(prefix: &str, record_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + record_id.len() + 1);
    key.extend_from_slice(prefix.as_bytes());
    key.push(0);
    key.extend_from_slice(record_id.as_bytes());
    key
}

fn index_prefix(prefix: &str) -> Vec<u8> {
    let mut key = prefix.as_bytes().to_vec();
    key.push(0);
    key
}

impl SledDocumentStore {
    /// Open (or create) a store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Self::from_db(db)
    }

    /// Store backed by a throwaway database, removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(to_storage_io)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            records: db.open_tree(TREE_RECORDS).map_err(to_storage_io)?,
            by_natural_key: db.open_tree(TREE_NATURAL_KEY_INDEX).map_err(to_storage_io)?,
            by_parent: db.open_tree(TREE_PARENT_INDEX).map_err(to_storage_io)?,
            replacements: db.open_tree(TREE_REPLACEMENTS).map_err(to_storage_io)?,
            db,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<Fields>, StorageError> {
        match self.records.get(id.as_bytes()).map_err(to_storage_io)? {
            Some(value) => Ok(Some(bincode::deserialize(&value).map_err(to_storage_data)?)),
            None => Ok(None),
        }
    }

    fn write(&self, id: &str, fields: &Fields) -> Result<(), StorageError> {
        let value = bincode::serialize(fields).map_err(to_storage_data)?;
        self.records
            .insert(id.as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(())
    }

    fn index(&self, id: &str, fields: &Fields) -> Result<(), StorageError> {
        if let Some(key) = fields.get(FIELD_NATURAL_KEY) {
            self.by_natural_key
                .insert(index_key(key, id), &[])
                .map_err(to_storage_io)?;
        }
        if let Some(parent) = fields.get(FIELD_PARENT_ID) {
            self.by_parent
                .insert(index_key(parent, id), &[])
                .map_err(to_storage_io)?;
        }
        Ok(())
    }

    fn unindex(&self, id: &str, fields: &Fields) -> Result<(), StorageError> {
        if let Some(key) = fields.get(FIELD_NATURAL_KEY) {
            self.by_natural_key
                .remove(index_key(key, id))
                .map_err(to_storage_io)?;
        }
        if let Some(parent) = fields.get(FIELD_PARENT_ID) {
            self.by_parent
                .remove(index_key(parent, id))
                .map_err(to_storage_io)?;
        }
        Ok(())
    }

    /// Records listed under `prefix` in `index` whose `field` still equals `prefix`.
    fn scan_index(
        &self,
        index: &sled::Tree,
        prefix: &str,
        field: &str,
    ) -> Result<Vec<Record>, StorageError> {
        let mut out = Vec::new();
        let scan = index_prefix(prefix);
        for item in index.scan_prefix(&scan) {
            let (key, _) = item.map_err(to_storage_io)?;
            let id = String::from_utf8_lossy(&key[scan.len()..]).to_string();
            if let Some(fields) = self.read(&id)? {
                if fields.get(field).map(|v| v.as_str()) == Some(prefix) {
                    out.push(Record { id, fields });
                }
            }
        }
        Ok(out)
    }
}

impl DocumentStore for SledDocumentStore {
    fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Vec<Record>, StorageError> {
        self.scan_index(&self.by_natural_key, &key.to_string(), FIELD_NATURAL_KEY)
    }

    fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.read(id)?.map(|fields| Record {
            id: id.to_string(),
            fields,
        }))
    }

    fn create(&self, fields: Fields) -> Result<RecordId, StorageError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.write(&id, &fields)?;
        self.index(&id, &fields)?;
        Ok(id)
    }

    fn update(&self, id: &str, fields: Fields) -> Result<(), StorageError> {
        let mut current = self
            .read(id)?
            .ok_or_else(|| StorageError::RecordNotFound(id.to_string()))?;
        let previous = current.clone();
        current.extend(fields);
        self.write(id, &current)?;
        self.unindex(id, &previous)?;
        self.index(id, &current)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let Some(fields) = self.read(id)? else {
            return Err(StorageError::RecordNotFound(id.to_string()));
        };
        self.records.remove(id.as_bytes()).map_err(to_storage_io)?;
        self.unindex(id, &fields)?;
        Ok(())
    }

    fn find_dependents(&self, id: &str) -> Result<Vec<Record>, StorageError> {
        self.scan_index(&self.by_parent, id, FIELD_PARENT_ID)
    }

    fn list(&self) -> Result<Vec<Record>, StorageError> {
        let mut records = Vec::new();
        for item in self.records.iter() {
            let (key, value) = item.map_err(to_storage_io)?;
            let fields: Fields = bincode::deserialize(&value).map_err(to_storage_data)?;
            records.push(Record {
                id: String::from_utf8_lossy(&key).to_string(),
                fields,
            });
        }
        Ok(records)
    }

    fn put_replacement(&self, entry: &ReplacementEntry) -> Result<(), StorageError> {
        let value = serde_json::to_vec(entry).map_err(to_storage_data)?;
        self.replacements
            .insert(entry.old_record_id.as_bytes(), value)
            .map_err(to_storage_io)?;
        self.replacements.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn pending_replacements(&self) -> Result<Vec<ReplacementEntry>, StorageError> {
        let mut out = Vec::new();
        for item in self.replacements.iter() {
            let (_, value) = item.map_err(to_storage_io)?;
            out.push(serde_json::from_slice(&value).map_err(to_storage_data)?);
        }
        Ok(out)
    }

    fn clear_replacement(&self, old_record_id: &str) -> Result<(), StorageError> {
        self.replacements
            .remove(old_record_id.as_bytes())
            .map_err(to_storage_io)?;
        Ok(())
    }
}
