//! LMDB-backed index for the local tier.
//!
//! Maps cache keys to [`ArtifactRecord`]s serialized as JSON. Every mutation
//! is its own write transaction; transactions are never held across an await.

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use reverie_core::{ArtifactRecord, CacheKey, TierError, TierKind};

/// Error type for index operations.
#[derive(Debug, thiserror::Error)]
pub enum LocalIndexError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LocalIndexError> for TierError {
    fn from(e: LocalIndexError) -> Self {
        match e {
            LocalIndexError::Serialization(reason) => TierError::Serialization { reason },
            other => TierError::io(TierKind::Local, other),
        }
    }
}

const RECORDS_DB: &str = "records";

/// Persistent key to record map.
pub struct LocalIndex {
    env: Env,
    records: Database<Str, Bytes>,
}

impl LocalIndex {
    /// Open (or create) the index environment in `path`.
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self, LocalIndexError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LocalIndexError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let records: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(RECORDS_DB))
            .map_err(|e| LocalIndexError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;

        Ok(Self { env, records })
    }

    /// Shared environment, so other small stores can live beside the index.
    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<ArtifactRecord>, LocalIndexError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let bytes = self
            .records
            .get(&rtxn, key.as_str())
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        bytes.map(decode).transpose()
    }

    /// Insert or replace. Returns the record that was replaced.
    pub fn put(&self, record: &ArtifactRecord) -> Result<Option<ArtifactRecord>, LocalIndexError> {
        let encoded =
            serde_json::to_vec(record).map_err(|e| LocalIndexError::Serialization(e.to_string()))?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let previous = self
            .records
            .get(&wtxn, record.key.as_str())
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?
            .and_then(|bytes| decode(bytes).ok());
        self.records
            .put(&mut wtxn, record.key.as_str(), &encoded)
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;

        Ok(previous)
    }

    /// Remove the entry. Returns the removed record, if any.
    pub fn delete(&self, key: &CacheKey) -> Result<Option<ArtifactRecord>, LocalIndexError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let previous = self
            .records
            .get(&wtxn, key.as_str())
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?
            .and_then(|bytes| decode(bytes).ok());
        self.records
            .delete(&mut wtxn, key.as_str())
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;

        Ok(previous)
    }

    /// Every decodable record. Undecodable rows are skipped and returned as
    /// raw keys so the caller can purge them.
    pub fn scan(&self) -> Result<(Vec<ArtifactRecord>, Vec<String>), LocalIndexError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let iter = self
            .records
            .iter(&rtxn)
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;

        let mut records = Vec::new();
        let mut broken = Vec::new();
        for result in iter {
            let Ok((key, bytes)) = result else { continue };
            match decode(bytes) {
                Ok(record) if record.key.as_str() == key => records.push(record),
                _ => broken.push(key.to_string()),
            }
        }
        Ok((records, broken))
    }

    /// Remove rows by raw key, used for rows [`scan`](Self::scan) could not decode.
    pub fn delete_raw(&self, keys: &[String]) -> Result<u64, LocalIndexError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let mut deleted = 0u64;
        for key in keys {
            if self.records.delete(&mut wtxn, key).unwrap_or(false) {
                deleted += 1;
            }
        }
        wtxn.commit()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        Ok(deleted)
    }

    pub fn clear(&self) -> Result<u64, LocalIndexError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        let count = self
            .records
            .len(&wtxn)
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        self.records
            .clear(&mut wtxn)
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LocalIndexError::Transaction(e.to_string()))?;
        Ok(count)
    }
}

fn decode(bytes: &[u8]) -> Result<ArtifactRecord, LocalIndexError> {
    serde_json::from_slice(bytes).map_err(|e| LocalIndexError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reverie_core::{compute_content_hash, SourceMetadata};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_index() -> (LocalIndex, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let index =
            LocalIndex::open(temp_dir.path(), 10 * 1024 * 1024).expect("index open should succeed");
        (index, temp_dir)
    }

    fn record(n: u8, size: u64) -> ArtifactRecord {
        let key = CacheKey::from_hex(&format!("{:032x}", n)).unwrap();
        let source = SourceMetadata {
            generator: "test".to_string(),
            namespace: "speech".to_string(),
            parameters: BTreeMap::new(),
            content_type: "audio/mpeg".to_string(),
            content_hash: compute_content_hash(&[n]),
        };
        ArtifactRecord::new(key, TierKind::Local, format!("/blobs/{n}"), size, source, Utc::now())
    }

    #[test]
    fn test_put_get_delete() {
        let (index, _dir) = create_test_index();
        let r = record(1, 10);
        assert!(index.put(&r).expect("put should succeed").is_none());
        assert_eq!(index.get(&r.key).unwrap(), Some(r.clone()));

        let replaced = index.put(&record(1, 20)).unwrap();
        assert_eq!(replaced.map(|p| p.byte_size), Some(10));

        let removed = index.delete(&r.key).unwrap();
        assert_eq!(removed.map(|p| p.byte_size), Some(20));
        assert!(index.get(&r.key).unwrap().is_none());
    }

    #[test]
    fn test_scan_and_clear() {
        let (index, _dir) = create_test_index();
        for n in 0..5 {
            index.put(&record(n, 1)).unwrap();
        }
        let (records, broken) = index.scan().unwrap();
        assert_eq!(records.len(), 5);
        assert!(broken.is_empty());
        assert_eq!(index.clear().unwrap(), 5);
        assert!(index.scan().unwrap().0.is_empty());
    }

    #[test]
    fn test_index_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let r = record(3, 42);
        {
            let index = LocalIndex::open(temp_dir.path(), 10 * 1024 * 1024).unwrap();
            index.put(&r).unwrap();
        }
        let index = LocalIndex::open(temp_dir.path(), 10 * 1024 * 1024).unwrap();
        assert_eq!(index.get(&r.key).unwrap(), Some(r));
    }
}
