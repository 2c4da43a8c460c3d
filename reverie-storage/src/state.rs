//! LMDB-backed persistence for quota governor state.

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use reverie_core::{QuotaState, QuotaStore, TierError, TierKind};

use crate::cache::LocalIndexError;

const QUOTA_DB: &str = "quota";
const STATE_KEY: &str = "state";

/// Stores a single [`QuotaState`] row. Every save is one committed write
/// transaction, so usage survives a crash immediately after a call.
pub struct LmdbQuotaStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbQuotaStore {
    /// Open a dedicated environment at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TierError> {
        std::fs::create_dir_all(&path).map_err(|e| TierError::io(TierKind::Local, e))?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| TierError::from(LocalIndexError::EnvOpen(e.to_string())))?;
        Self::with_env(env)
    }

    /// Live beside other databases in an existing environment.
    pub fn with_env(env: Env) -> Result<Self, TierError> {
        let mut wtxn = env
            .write_txn()
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(QUOTA_DB))
            .map_err(|e| TierError::from(LocalIndexError::DbOpen(e.to_string())))?;
        wtxn.commit()
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        Ok(Self { env, db })
    }
}

impl QuotaStore for LmdbQuotaStore {
    fn load(&self) -> Result<Option<QuotaState>, TierError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        let Some(bytes) = self
            .db
            .get(&rtxn, STATE_KEY)
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| TierError::Serialization {
                reason: format!("quota state: {}", e),
            })
    }

    fn save(&self, state: &QuotaState) -> Result<(), TierError> {
        let encoded = serde_json::to_vec(state).map_err(|e| TierError::Serialization {
            reason: format!("quota state: {}", e),
        })?;
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        self.db
            .put(&mut wtxn, STATE_KEY, &encoded)
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        wtxn.commit()
            .map_err(|e| TierError::from(LocalIndexError::Transaction(e.to_string())))?;
        Ok(())
    }
}
