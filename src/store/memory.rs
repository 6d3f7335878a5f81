use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Generator;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::{Change, ChangeKind, Event, Record, Revision};
use crate::notify::ChangeHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{CollectionSnapshot, RemoteStore, StoreError, WriteMode};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is running are committed
/// together with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even when an append failed so its partial bytes don't ride along
    // with the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    let outcome = appended.and(flushed);
    for (_, response) in batch {
        let result = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(result);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Collections ──────────────────────────────────────────

#[derive(Default)]
struct Collection {
    revision: Revision,
    records: BTreeMap<String, Record>,
}

type SharedCollection = Arc<RwLock<Collection>>;

fn event_path(event: &Event) -> &str {
    match event {
        Event::RecordPut { path, .. } | Event::RecordRemoved { path, .. } => path,
    }
}

/// Apply an event to a collection (caller holds the lock) and describe what changed.
fn apply_event(coll: &mut Collection, event: &Event) -> Change {
    coll.revision += 1;
    match event {
        Event::RecordPut { path, key, record } => {
            let kind = match coll.records.insert(key.clone(), record.clone()) {
                Some(_) => ChangeKind::Changed,
                None => ChangeKind::Added,
            };
            Change {
                path: path.clone(),
                key: key.clone(),
                kind,
                revision: coll.revision,
                record: Some(record.clone()),
            }
        }
        Event::RecordRemoved { path, key } => {
            coll.records.remove(key);
            Change {
                path: path.clone(),
                key: key.clone(),
                kind: ChangeKind::Removed,
                revision: coll.revision,
                record: None,
            }
        }
    }
}

/// In-process keyed-record store with per-collection revisions and change-feeds.
///
/// Writes to one collection are serialized by that collection's lock; a change
/// is broadcast while the lock is still held, so watchers observe revisions in
/// order. With a WAL attached, a write is acknowledged only after it is fsynced.
pub struct MemoryStore {
    collections: DashMap<String, SharedCollection>,
    hub: ChangeHub,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Writers share it; compaction takes it exclusively so no append can slip
    /// between building the compacted image and swapping it in.
    compaction_gate: RwLock<()>,
    /// Monotonic within a millisecond, so key order is append order.
    keys: Mutex<Generator>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store. Contents live as long as the value.
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            hub: ChangeHub::new(),
            wal_tx: None,
            compaction_gate: RwLock::new(()),
            keys: Mutex::new(Generator::new()),
        }
    }

    /// Durable store backed by the log at `path`, replayed on open.
    /// Spawns the group-commit writer, so it must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed: HashMap<String, Collection> = HashMap::new();
        for event in &events {
            let coll = replayed.entry(event_path(event).to_string()).or_default();
            apply_event(coll, event);
        }
        let collections = DashMap::new();
        for (path, coll) in replayed {
            collections.insert(path, Arc::new(RwLock::new(coll)));
        }
        info!(events = events.len(), path = %path.display(), "store log replayed");

        Ok(Self {
            collections,
            hub: ChangeHub::new(),
            wal_tx: Some(wal_tx),
            compaction_gate: RwLock::new(()),
            keys: Mutex::new(Generator::new()),
        })
    }

    /// Live change-feed receivers on `path`.
    pub fn watcher_count(&self, path: &str) -> usize {
        self.hub.receiver_count(path)
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    fn next_key(&self) -> Result<String, StoreError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.generate()
            .map(|id| id.to_string())
            .map_err(|e| StoreError::Write(format!("key generation: {e}")))
    }

    fn collection(&self, path: &str) -> SharedCollection {
        self.collections
            .entry(path.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Write("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Write("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    /// WAL-append + apply + broadcast. Caller holds the collection write lock.
    async fn persist_and_apply(
        &self,
        coll: &mut Collection,
        event: Event,
    ) -> Result<Revision, StoreError> {
        self.wal_append(&event).await?;
        let change = apply_event(coll, &event);
        let revision = change.revision;
        self.hub.send(change);
        Ok(revision)
    }

    /// Rewrite the log as one put per live record. No-op for a volatile store.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _exclusive = self.compaction_gate.write().await;

        let mut paths: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        let mut events = Vec::new();
        for path in paths {
            let coll = self.collection(&path);
            let guard = coll.read().await;
            for (key, record) in &guard.records {
                events.push(Event::RecordPut {
                    path: path.clone(),
                    key: key.clone(),
                    record: record.clone(),
                });
            }
        }
        let live = events.len();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Write("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Write("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Write(e.to_string()))?;
        info!(records = live, "store log compacted");
        Ok(())
    }

    /// Appends since the last compaction; 0 for a volatile store.
    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<CollectionSnapshot, StoreError> {
        let Some(coll) = self.collections.get(path).map(|e| e.value().clone()) else {
            return Ok(CollectionSnapshot::default());
        };
        let guard = coll.read().await;
        Ok(CollectionSnapshot {
            revision: guard.revision,
            records: guard.records.clone(),
        })
    }

    async fn append(&self, path: &str, record: Record) -> Result<(String, Revision), StoreError> {
        let _shared = self.compaction_gate.read().await;
        let coll = self.collection(path);
        let mut guard = coll.write().await;
        // Drawn under the collection lock so key order matches revision order.
        let key = self.next_key()?;
        let event = Event::RecordPut {
            path: path.to_string(),
            key: key.clone(),
            record,
        };
        let revision = self.persist_and_apply(&mut guard, event).await?;
        Ok((key, revision))
    }

    async fn put(
        &self,
        path: &str,
        key: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<Revision, StoreError> {
        let _shared = self.compaction_gate.read().await;
        let coll = self.collection(path);
        let mut guard = coll.write().await;
        let record = match (mode, guard.records.get(key)) {
            (WriteMode::Replace, None) => {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                    key: key.to_string(),
                });
            }
            (WriteMode::IfAbsent, Some(_)) => return Ok(guard.revision),
            (WriteMode::Merge, Some(existing)) => {
                let mut merged = existing.clone();
                merged.extend(record);
                merged
            }
            _ => record,
        };
        let event = Event::RecordPut {
            path: path.to_string(),
            key: key.to_string(),
            record,
        };
        self.persist_and_apply(&mut guard, event).await
    }

    async fn remove(&self, path: &str, key: &str) -> Result<Revision, StoreError> {
        let _shared = self.compaction_gate.read().await;
        let coll = self.collection(path);
        let mut guard = coll.write().await;
        if !guard.records.contains_key(key) {
            return Ok(guard.revision);
        }
        let event = Event::RecordRemoved {
            path: path.to_string(),
            key: key.to_string(),
        };
        self.persist_and_apply(&mut guard, event).await
    }

    fn watch(&self, path: &str) -> broadcast::Receiver<Change> {
        self.hub.subscribe(path)
    }
}
