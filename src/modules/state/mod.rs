//! Durable relay state.
//!
//! A single redb table maps fixed keys to JSON documents. The pending-request
//! queue and the signed session credential live here so they survive a
//! session reload as well as a process restart.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::transport::protocol::{FileToUpload, WorkItem};

const STATE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("relay_state");

pub const PENDING_REQUESTS_KEY: &str = "pending_requests";
pub const AUTH_CREDENTIAL_KEY: &str = "auth_credential";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state database error: {0}")]
    Database(#[from] redb::Error),
    #[error("state document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn db_err(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Database(err.into())
}

/// Key/value store of JSON documents backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Volatile store, used by tests and `--ephemeral` runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(STATE_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(db_err(err)),
        };
        match table.get(key).map_err(db_err)? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(db_err)?;
            table.insert(key, encoded.as_str()).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(db_err)?;
            table.remove(key).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)
    }

    /// Read-modify-write of one document inside a single write transaction.
    /// `apply` receives the current value (if any) and returns the value to
    /// store (`None` deletes the key) together with a result for the caller.
    pub fn update<T, R, F>(&self, key: &str, apply: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> (Option<T>, R),
    {
        let txn = self.db.begin_write().map_err(db_err)?;
        let result = {
            let mut table = txn.open_table(STATE_TABLE).map_err(db_err)?;
            let current = table
                .get(key)
                .map_err(db_err)?
                .map(|raw| raw.value().to_string());
            let current = match current {
                Some(raw) => Some(serde_json::from_str::<T>(&raw)?),
                None => None,
            };

            let (next, result) = apply(current);
            match next {
                Some(value) => {
                    let encoded = serde_json::to_string(&value)?;
                    table.insert(key, encoded.as_str()).map_err(db_err)?;
                }
                None => {
                    table.remove(key).map_err(db_err)?;
                }
            }
            result
        };
        txn.commit().map_err(db_err)?;
        Ok(result)
    }
}

/// Request whose completion was deferred across a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub request_id: String,
    pub payload: Value,
    #[serde(default)]
    pub files_to_upload: Vec<FileToUpload>,
}

impl PendingEntry {
    pub fn has_files(&self) -> bool {
        !self.files_to_upload.is_empty()
    }
}

impl From<&WorkItem> for PendingEntry {
    fn from(work: &WorkItem) -> Self {
        Self {
            request_id: work.request_id.clone(),
            payload: work.payload.clone(),
            files_to_upload: work.files_to_upload.clone(),
        }
    }
}

impl From<PendingEntry> for WorkItem {
    fn from(entry: PendingEntry) -> Self {
        Self {
            request_id: entry.request_id,
            payload: entry.payload,
            files_to_upload: entry.files_to_upload,
        }
    }
}

/// Durable ordered set of [`PendingEntry`] values, unique by request id.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    store: StateStore,
}

impl PendingQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Appends `entry` unless its request id is already queued. Returns
    /// whether the entry was added.
    pub fn push_if_absent(&self, entry: PendingEntry) -> Result<bool, StoreError> {
        self.store
            .update::<Vec<PendingEntry>, _, _>(PENDING_REQUESTS_KEY, |current| {
                let mut entries = current.unwrap_or_default();
                if entries.iter().any(|queued| queued.request_id == entry.request_id) {
                    return (Some(entries), false);
                }
                entries.push(entry);
                (Some(entries), true)
            })
    }

    pub fn entries(&self) -> Result<Vec<PendingEntry>, StoreError> {
        Ok(self
            .store
            .get::<Vec<PendingEntry>>(PENDING_REQUESTS_KEY)?
            .unwrap_or_default())
    }

    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| entry.request_id)
            .collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Reads and clears the whole queue in one transaction.
    pub fn take_all(&self) -> Result<Vec<PendingEntry>, StoreError> {
        self.store
            .update::<Vec<PendingEntry>, _, _>(PENDING_REQUESTS_KEY, |current| {
                (None, current.unwrap_or_default())
            })
    }
}

/// Signed session material with its absolute expiry (Unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: i64,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// `true` while more than `margin` remains before expiry.
    pub fn is_fresh(&self, now: i64, margin: Duration) -> bool {
        let margin = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
        self.expires_at.saturating_sub(now) > margin
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    store: StateStore,
    margin: Duration,
}

impl CredentialStore {
    pub fn new(store: StateStore, margin: Duration) -> Self {
        Self { store, margin }
    }

    /// Stored credential if still fresh. A stale credential is deleted.
    pub fn load_valid(&self) -> Result<Option<Credential>, StoreError> {
        let Some(credential) = self.store.get::<Credential>(AUTH_CREDENTIAL_KEY)? else {
            return Ok(None);
        };
        if credential.is_fresh(Utc::now().timestamp(), self.margin) {
            return Ok(Some(credential));
        }
        log::debug!("stored credential expires at {}; discarding", credential.expires_at);
        self.clear()?;
        Ok(None)
    }

    pub fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        self.store.put(AUTH_CREDENTIAL_KEY, credential)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(AUTH_CREDENTIAL_KEY)
    }
}
