use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::codec::{decode_reservation, encode_reservation, record_origin};
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::RECORDS_SKIPPED_TOTAL;
use crate::store::{CollectionSnapshot, RemoteStore, WriteMode, RESERVATIONS};

/// Store acknowledgement of a newly created reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub id: Ulid,
    pub revision: Revision,
}

/// One delivery on the raw insertion feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Added {
        reservation: Reservation,
        /// Session that created the record, if it was tagged.
        origin: Option<String>,
    },
    /// Everything that existed at subscription time has been delivered.
    Synced,
}

// ── Subscriptions ────────────────────────────────────────

/// Holds a callback until the subscription is closed.
struct Listener<T> {
    callback: Mutex<Option<Box<dyn Fn(T) + Send>>>,
}

impl<T> Listener<T> {
    fn new(callback: impl Fn(T) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Run the callback unless closed. Returns false once closed.
    fn deliver(&self, value: T) -> bool {
        let guard = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }
}

trait Close: Send + Sync {
    fn close(&self);
}

impl<T: Send> Close for Listener<T> {
    fn close(&self) {
        // Waits for an in-flight callback, so nothing runs after close returns.
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Handle for a live feed. Unsubscribing (or dropping) stops further callbacks
/// and releases the store listener.
///
/// Must not be unsubscribed from inside its own callback.
pub struct Subscription {
    listener: Arc<dyn Close>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listener.close();
        self.cancel.cancel();
    }
}

/// Drain everything already queued; the next full read covers it.
fn drain(changes: &mut broadcast::Receiver<Change>) -> bool {
    loop {
        match changes.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Empty) => return true,
            Err(broadcast::error::TryRecvError::Closed) => return false,
        }
    }
}

fn decode_snapshot(snapshot: &CollectionSnapshot) -> Snapshot {
    let mut reservations = Vec::with_capacity(snapshot.records.len());
    for (key, record) in &snapshot.records {
        match decode_reservation(key, record) {
            Ok(r) => reservations.push(r),
            Err(e) => {
                warn!(key = %key, "skipping reservation record: {e}");
                metrics::counter!(RECORDS_SKIPPED_TOTAL, "collection" => "reservations")
                    .increment(1);
            }
        }
    }
    Snapshot {
        revision: snapshot.revision,
        reservations,
    }
}

async fn run_snapshot_feed(
    store: Arc<dyn RemoteStore>,
    mut changes: broadcast::Receiver<Change>,
    listener: Arc<Listener<Snapshot>>,
    cancel: CancellationToken,
) {
    let mut delivered: Option<Revision> = None;
    loop {
        match store.read(RESERVATIONS).await {
            Ok(snapshot) if delivered != Some(snapshot.revision) => {
                let revision = snapshot.revision;
                if cancel.is_cancelled() || !listener.deliver(decode_snapshot(&snapshot)) {
                    break;
                }
                delivered = Some(revision);
            }
            Ok(_) => {}
            Err(e) => error!("reservation snapshot read failed: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = changes.recv() => match msg {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if !drain(&mut changes) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("snapshot feed stopped");
}

async fn run_insertion_feed(
    store: Arc<dyn RemoteStore>,
    mut changes: broadcast::Receiver<Change>,
    listener: Arc<Listener<Insertion>>,
    cancel: CancellationToken,
) {
    // Existing records first, in key order (the store keeps keys monotonic), then the sync marker.
    let baseline = match store.read(RESERVATIONS).await {
        Ok(snapshot) => {
            for (key, record) in &snapshot.records {
                let Some(insertion) = decode_insertion(key, record) else {
                    continue;
                };
                if !listener.deliver(insertion) {
                    return;
                }
            }
            snapshot.revision
        }
        Err(e) => {
            error!("initial reservation read failed, insertion feed starts empty: {e}");
            0
        }
    };
    if !listener.deliver(Insertion::Synced) {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = changes.recv() => match msg {
                Ok(change) => {
                    if change.kind != ChangeKind::Added || change.revision <= baseline {
                        continue;
                    }
                    let Some(record) = &change.record else { continue };
                    let Some(insertion) = decode_insertion(&change.key, record) else {
                        continue;
                    };
                    if !listener.deliver(insertion) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("insertion feed lagged, {n} changes lost"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("insertion feed stopped");
}

fn decode_insertion(key: &str, record: &Record) -> Option<Insertion> {
    match decode_reservation(key, record) {
        Ok(reservation) => Some(Insertion::Added {
            reservation,
            origin: record_origin(record).map(str::to_string),
        }),
        Err(e) => {
            warn!(key = %key, "skipping inserted record: {e}");
            metrics::counter!(RECORDS_SKIPPED_TOTAL, "collection" => "reservations").increment(1);
            None
        }
    }
}

// ── Adapter ──────────────────────────────────────────────

/// The engine's only channel to the `reservations` collection.
pub struct ReservationStore {
    store: Arc<dyn RemoteStore>,
    session: String,
}

impl ReservationStore {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            session: Ulid::new().to_string(),
        }
    }

    /// Tag written into every record this adapter creates.
    pub fn session_id(&self) -> &str {
        &self.session
    }

    /// One-off full read.
    pub async fn snapshot(&self) -> Result<Snapshot, EngineError> {
        let snapshot = self.store.read(RESERVATIONS).await?;
        Ok(decode_snapshot(&snapshot))
    }

    /// Call `callback` with the full reservation set now and after every change.
    /// Bursts of changes are coalesced into one delivery.
    pub fn subscribe(&self, callback: impl Fn(Snapshot) + Send + 'static) -> Subscription {
        let changes = self.store.watch(RESERVATIONS);
        let listener = Listener::new(callback);
        let cancel = CancellationToken::new();
        tokio::spawn(run_snapshot_feed(
            self.store.clone(),
            changes,
            listener.clone(),
            cancel.clone(),
        ));
        Subscription { listener, cancel }
    }

    /// Call `callback` once per record: existing ones, then [`Insertion::Synced`],
    /// then each new insertion as it lands.
    pub fn on_record_added(&self, callback: impl Fn(Insertion) + Send + 'static) -> Subscription {
        let changes = self.store.watch(RESERVATIONS);
        let listener = Listener::new(callback);
        let cancel = CancellationToken::new();
        tokio::spawn(run_insertion_feed(
            self.store.clone(),
            changes,
            listener.clone(),
            cancel.clone(),
        ));
        Subscription { listener, cancel }
    }

    pub async fn create(&self, draft: &ReservationDraft) -> Result<Created, EngineError> {
        let record = encode_reservation(draft, Some(&self.session));
        let (key, revision) = self.store.append(RESERVATIONS, record).await?;
        let id = Ulid::from_string(&key)
            .map_err(|_| EngineError::Write(format!("store assigned a non-ULID key: {key}")))?;
        Ok(Created { id, revision })
    }

    /// Full replace of the record at `reservation.id`.
    pub async fn update(&self, reservation: &Reservation) -> Result<Revision, EngineError> {
        let record = encode_reservation(&reservation.to_draft(), None);
        let revision = self
            .store
            .put(
                RESERVATIONS,
                &reservation.id.to_string(),
                record,
                WriteMode::Replace,
            )
            .await?;
        Ok(revision)
    }

    /// Idempotent delete.
    pub async fn remove(&self, id: Ulid) -> Result<Revision, EngineError> {
        Ok(self.store.remove(RESERVATIONS, &id.to_string()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::store::MemoryStore;

    fn draft(name: &str, seats: u32) -> ReservationDraft {
        ReservationDraft {
            full_name: name.into(),
            phone: "555-0101".into(),
            date: parse_date("2024-05-01").unwrap(),
            time: "19:00".into(),
            seats,
            special_requests: None,
        }
    }

    fn adapter() -> (Arc<MemoryStore>, ReservationStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ReservationStore::new(store))
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("feed closed")
    }

    /// Wait for a snapshot matching `pred`, skipping intermediate ones.
    async fn snapshot_where(
        rx: &mut mpsc::UnboundedReceiver<Snapshot>,
        pred: impl Fn(&Snapshot) -> bool,
    ) -> Snapshot {
        loop {
            let snap = next(rx).await;
            if pred(&snap) {
                return snap;
            }
        }
    }

    #[tokio::test]
    async fn create_update_remove() {
        let (_, adapter) = adapter();
        let created = adapter.create(&draft("Anna", 2)).await.unwrap();
        assert_eq!(created.revision, 1);

        let mut updated = Reservation::from_draft(created.id, draft("Anna", 2));
        updated.seats = 5;
        assert_eq!(adapter.update(&updated).await.unwrap(), 2);

        let snap = adapter.snapshot().await.unwrap();
        assert_eq!(snap.reservations, vec![updated]);

        adapter.remove(created.id).await.unwrap();
        adapter.remove(created.id).await.unwrap();
        assert!(adapter.snapshot().await.unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn update_of_vanished_record_is_not_found() {
        let (_, adapter) = adapter();
        let ghost = Reservation::from_draft(Ulid::new(), draft("Ghost", 1));
        let err = adapter.update(&ghost).await.unwrap_err();
        assert!(matches!(err, EngineError::ReservationNotFound(id) if id == ghost.id));
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_and_subsequent_snapshots() {
        let (_, adapter) = adapter();
        adapter.create(&draft("Existing", 2)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = adapter.subscribe(move |snap| {
            let _ = tx.send(snap);
        });

        let first = next(&mut rx).await;
        assert_eq!(first.reservations.len(), 1);

        let created = adapter.create(&draft("Newcomer", 3)).await.unwrap();
        let snap = snapshot_where(&mut rx, |s| s.revision >= created.revision).await;
        assert_eq!(snap.reservations.len(), 2);
        assert!(snap.reservations.iter().any(|r| r.id == created.id));
        drop(sub);
    }

    #[tokio::test]
    async fn unsubscribe_stops_callbacks() {
        let (store, adapter) = adapter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = adapter.subscribe(move |snap| {
            let _ = tx.send(snap);
        });
        next(&mut rx).await;
        assert!(sub.is_active());
        sub.unsubscribe();

        adapter.create(&draft("After", 2)).await.unwrap();
        // The callback (and its sender) is gone once unsubscribe returns.
        assert!(rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.watcher_count(RESERVATIONS), 0);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let (store, adapter) = adapter();
        adapter.create(&draft("Good", 2)).await.unwrap();
        let mut junk = Record::new();
        junk.insert("seats".into(), Field::from("many"));
        store.append(RESERVATIONS, junk).await.unwrap();

        let snap = adapter.snapshot().await.unwrap();
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.reservations.len(), 1);
        assert_eq!(snap.reservations[0].full_name, "Good");
    }

    #[tokio::test]
    async fn insertion_feed_replays_existing_then_syncs_then_streams() {
        let (store, adapter) = adapter();
        let a = adapter.create(&draft("A", 1)).await.unwrap();
        let b = adapter.create(&draft("B", 1)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = adapter.on_record_added(move |ins| {
            let _ = tx.send(ins);
        });

        let ids = |ins: Insertion| match ins {
            Insertion::Added { reservation, .. } => Some(reservation.id),
            Insertion::Synced => None,
        };
        assert_eq!(ids(next(&mut rx).await), Some(a.id));
        assert_eq!(ids(next(&mut rx).await), Some(b.id));
        assert_eq!(next(&mut rx).await, Insertion::Synced);

        // Updates and removals are not insertions.
        let mut changed = Reservation::from_draft(a.id, draft("A", 1));
        changed.seats = 2;
        adapter.update(&changed).await.unwrap();
        adapter.remove(b.id).await.unwrap();

        let other = ReservationStore::new(store.clone());
        let c = other.create(&draft("C", 4)).await.unwrap();
        match next(&mut rx).await {
            Insertion::Added {
                reservation,
                origin,
            } => {
                assert_eq!(reservation.id, c.id);
                assert_eq!(origin.as_deref(), Some(other.session_id()));
            }
            Insertion::Synced => panic!("unexpected second sync marker"),
        }
    }

    #[tokio::test]
    async fn created_records_carry_session_origin() {
        let (store, adapter) = adapter();
        let created = adapter.create(&draft("Tagged", 2)).await.unwrap();
        let snap = store.read(RESERVATIONS).await.unwrap();
        let record = &snap.records[&created.id.to_string()];
        assert_eq!(record_origin(record), Some(adapter.session_id()));
    }
}
