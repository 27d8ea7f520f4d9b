//! Keyed persistence of calibration records.
//!
//! The durable backend is anything implementing [`KvStore`]: a string
//! key to string value mapping with save/get, the minimal surface a
//! networked key-value service exposes. [`RecordStore`] layers the record
//! contract on top: serialization on save, and identity validation on
//! every retrieval so a caller can never silently feed-forward from the
//! wrong calibration.
//!
//! The store handle is constructed explicitly and passed in by the
//! caller; there is no ambient singleton client.

use crate::record::{Record, RecordError};
use dashmap::DashMap;
use std::future::Future;
use thiserror::Error;

/// Error from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No value stored under the requested key
    #[error("no record found for key {key:?}")]
    NotFound { key: String },

    /// Stored record's identity disagrees with the query
    #[error(
        "record does not match the requested harmonic ({harmonic}), \
         element ({element}), or edge ({edge})"
    )]
    Mismatch {
        harmonic: u32,
        element: String,
        edge: String,
    },

    /// Record failed to encode or decode
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Backend transport failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Minimal keyed string storage.
///
/// `save` overwrites whole values (last write wins, no merge); `get`
/// returns `None` for an absent key.
pub trait KvStore: Send + Sync {
    fn save(&self, key: &str, value: String) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;
}

/// In-memory [`KvStore`] backend. Contents are lost on process exit;
/// durability comes from pointing [`RecordStore`] at a persistent backend
/// instead.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    async fn save(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

/// Record persistence over a [`KvStore`] backend.
pub struct RecordStore<S> {
    backend: S,
}

impl<S: KvStore> RecordStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Persist one record, replacing any existing entry at `key`.
    pub async fn save(&self, key: &str, record: &Record) -> Result<(), StoreError> {
        self.backend.save(key, record.to_json()?).await
    }

    /// Persist a batch of records.
    pub async fn save_batch(&self, entries: &[(String, Record)]) -> Result<(), StoreError> {
        for (key, record) in entries {
            self.save(key, record).await?;
        }
        Ok(())
    }

    /// Retrieve and decode the record at `key`, validating that it is the
    /// calibration the caller asked for.
    ///
    /// A missing key is [`StoreError::NotFound`]; a stored record whose
    /// (harmonic, element, edge) triple disagrees with the arguments is
    /// [`StoreError::Mismatch`] and is never returned.
    pub async fn get(
        &self,
        key: &str,
        harmonic: u32,
        element: &str,
        edge: &str,
    ) -> Result<Record, StoreError> {
        let text = self
            .backend
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        let record = Record::from_json(&text)?;

        if !record.matches_identity(harmonic, element, edge) {
            return Err(StoreError::Mismatch {
                harmonic,
                element: element.to_string(),
                edge: edge.to_string(),
            });
        }
        Ok(record)
    }

    /// Retrieve a record and return its fitted quadratic as a closure,
    /// ready for feed-forward gap lookups.
    pub async fn lookup_curve(
        &self,
        key: &str,
        harmonic: u32,
        element: &str,
        edge: &str,
    ) -> Result<impl Fn(f64) -> f64, StoreError> {
        let record = self.get(key, harmonic, element, edge).await?;
        Ok(record.regression_function()?)
    }
}
