use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use weft_config::StoreConfig;

/// A persisted value carrying an opaque compare-and-swap token.
pub trait Record: Serialize + DeserializeOwned + Default + Send {
    fn version(&self) -> &str;
    fn set_version(&mut self, version: String);
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.retry_initial_ms.max(1)),
            max_interval: Duration::from_millis(
                config.retry_max_interval_ms.max(config.retry_initial_ms.max(1)),
            ),
            max_elapsed: Duration::from_secs_f64(config.retry_max_elapsed_seconds.max(0.0)),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Releases the advisory lock for a key when dropped, unless another writer
/// has since taken it over.
struct VersionLock<'a> {
    locks: &'a DashMap<String, String>,
    key: String,
    token: String,
}

impl Drop for VersionLock<'_> {
    fn drop(&mut self) {
        let token = &self.token;
        self.locks.remove_if(&self.key, |_, held| held == token);
    }
}

/// Typed records layered over a [`KvStore`] with versioned read-modify-write.
///
/// The advisory lock table is process local; every writer of a given store
/// must share one `RecordStore`.
pub struct RecordStore<T> {
    name: String,
    kv: KvStore,
    locks: DashMap<String, String>,
    retry: RetryPolicy,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> RecordStore<T> {
    pub fn open(name: &str, db_path: &Path, retry: RetryPolicy) -> StoreResult<Self> {
        Ok(Self::with_kv(name, KvStore::open(db_path)?, retry))
    }

    pub fn in_memory(name: &str, retry: RetryPolicy) -> StoreResult<Self> {
        Ok(Self::with_kv(name, KvStore::open_in_memory()?, retry))
    }

    fn with_kv(name: &str, kv: KvStore, retry: RetryPolicy) -> Self {
        Self {
            name: name.to_string(),
            kv,
            locks: DashMap::new(),
            retry,
            _record: PhantomData,
        }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|err| StoreError::decode(key, err.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Unconditionally replaces the record under `key`. Last write wins.
    pub fn put(&self, key: &str, mut record: T) -> StoreResult<T> {
        record.set_version(Uuid::new_v4().to_string());
        self.write(key, &record)?;
        Ok(record)
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        self.kv.keys()
    }

    /// Reads the record (default when absent), applies `mutate` and writes the
    /// result only if no other writer committed in between. Conflicts are
    /// retried with exponential backoff until the policy's elapsed bound.
    pub async fn read_modify_write<F>(&self, key: &str, mut mutate: F) -> StoreResult<T>
    where
        F: FnMut(&mut T) -> anyhow::Result<()>,
    {
        let mut backoff = self.retry.backoff();
        backoff.reset();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (mut record, read_version) = self.read_for_update(key)?;

            mutate(&mut record).map_err(|err| StoreError::mutate(key, format!("{err:#}")))?;

            if let Some(_lock) = self.try_lock(key) {
                if self.stored_version(key)? == read_version {
                    record.set_version(Uuid::new_v4().to_string());
                    self.write(key, &record)?;
                    return Ok(record);
                }
            }

            debug!(
                "{}: version conflict on {} (attempt {})",
                self.name, key, attempt
            );
            match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    warn!(
                        "{}: giving up on {} after {} attempts",
                        self.name, key, attempt
                    );
                    return Err(StoreError::timeout(key));
                }
            }
        }
    }

    fn read_for_update(&self, key: &str) -> StoreResult<(T, Option<String>)> {
        match self.get(key)? {
            Some(record) => {
                let version = record.version().to_string();
                Ok((record, Some(version)))
            }
            None => {
                let mut record = T::default();
                record.set_version(Uuid::new_v4().to_string());
                Ok((record, None))
            }
        }
    }

    fn stored_version(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.get(key)?.map(|record| record.version().to_string()))
    }

    fn try_lock(&self, key: &str) -> Option<VersionLock<'_>> {
        let token = Uuid::new_v4().to_string();
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Some(VersionLock {
                    locks: &self.locks,
                    key: key.to_string(),
                    token,
                })
            }
        }
    }

    fn write(&self, key: &str, record: &T) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(record).map_err(|err| StoreError::encode(key, err.to_string()))?;
        self.kv.set(key, &bytes)
    }
}
