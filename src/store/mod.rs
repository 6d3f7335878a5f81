//! The remote keyed-record store the engine synchronizes against.
//!
//! The engine only ever sees [`RemoteStore`]: full collection reads, keyed
//! writes with merge semantics, and a live change-feed per collection.
//! [`MemoryStore`] is the in-process implementation, optionally made durable
//! with a write-ahead log.

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::{format_date, Change, Date, Record, Revision};

/// Collection holding one record per reservation, keyed by reservation id.
pub const RESERVATIONS: &str = "reservations";

/// Collection holding one record per slot for `date`, keyed by slot time.
pub fn shifts_path(date: &Date) -> String {
    format!("shifts/{}", format_date(date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the whole record. The key must already exist.
    Replace,
    /// Create the record, or overwrite only the given fields of an existing one.
    Merge,
    /// Create the record; leave an existing one untouched.
    IfAbsent,
}

/// Every record of a collection as of `revision`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSnapshot {
    pub revision: Revision,
    pub records: BTreeMap<String, Record>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { path: String, key: String },
    Read(String),
    Write(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound { path, key } => write!(f, "record not found: {path}/{key}"),
            StoreError::Read(e) => write!(f, "store read failed: {e}"),
            StoreError::Write(e) => write!(f, "store write failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Full contents of the collection at `path`. Unknown paths are empty at revision 0.
    async fn read(&self, path: &str) -> Result<CollectionSnapshot, StoreError>;

    /// Insert a record under a fresh store-assigned key.
    async fn append(&self, path: &str, record: Record) -> Result<(String, Revision), StoreError>;

    /// Write `record` at `key` according to `mode`. Returns the collection revision
    /// after the write; a no-op write returns the current revision unchanged.
    async fn put(
        &self,
        path: &str,
        key: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<Revision, StoreError>;

    /// Delete the record at `key`. Deleting an absent key succeeds without a change.
    async fn remove(&self, path: &str, key: &str) -> Result<Revision, StoreError>;

    /// Live feed of every change applied to `path` from now on.
    fn watch(&self, path: &str) -> broadcast::Receiver<Change>;
}
