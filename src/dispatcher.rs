//! Turns newly inserted reservations into notification intents.
//!
//! The dispatcher follows the adapter's insertion feed. Everything delivered
//! before the feed's `Synced` marker is the backlog that already existed and is
//! never announced. After that, each insertion yields exactly one
//! [`NotificationIntent`], except for records this session wrote itself unless
//! [`DispatchOptions::notify_local_writes`] is set.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::adapter::{Insertion, ReservationStore, Subscription};
use crate::model::NotificationIntent;
use crate::observability::NOTIFICATIONS_TOTAL;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Where intents go. Delivery is at-most-once; a failed delivery is counted and dropped.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, intent: NotificationIntent) -> Result<(), SinkError>;
}

/// Forwards intents to an in-process receiver.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NotificationIntent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, intent: NotificationIntent) -> Result<(), SinkError> {
        self.tx
            .send(intent)
            .map_err(|_| "notification receiver dropped".into())
    }
}

/// Writes each intent as a JSON payload to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, intent: NotificationIntent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&intent)?;
        info!(target: "shiftbook::notification", %payload, "{}", intent.title);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Also announce reservations created by this session.
    pub notify_local_writes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Replaying records that existed before the dispatcher started.
    Loading,
    Live,
}

/// Counts per outcome, returned on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub emitted: u64,
    pub initial_load: u64,
    pub local_echo: u64,
    pub failed: u64,
}

// ── Classification ───────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    InitialLoad,
    LocalEcho,
    Synced,
    Emit(NotificationIntent),
}

struct Classifier {
    phase: DispatchPhase,
    session: String,
    options: DispatchOptions,
}

impl Classifier {
    fn new(session: String, options: DispatchOptions) -> Self {
        Self {
            phase: DispatchPhase::Loading,
            session,
            options,
        }
    }

    fn classify(&mut self, insertion: Insertion) -> Decision {
        match (self.phase, insertion) {
            (_, Insertion::Synced) => {
                self.phase = DispatchPhase::Live;
                Decision::Synced
            }
            (DispatchPhase::Loading, Insertion::Added { .. }) => Decision::InitialLoad,
            (DispatchPhase::Live, Insertion::Added { reservation, origin }) => {
                let own = origin.as_deref() == Some(self.session.as_str());
                if own && !self.options.notify_local_writes {
                    Decision::LocalEcho
                } else {
                    Decision::Emit(NotificationIntent::new_reservation(&reservation))
                }
            }
        }
    }
}

async fn run_dispatch(
    mut rx: mpsc::UnboundedReceiver<Insertion>,
    mut classifier: Classifier,
    sink: Arc<dyn NotificationSink>,
    phase_tx: watch::Sender<DispatchPhase>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    while let Some(insertion) = rx.recv().await {
        let outcome = match classifier.classify(insertion) {
            Decision::Synced => {
                if *phase_tx.borrow() == DispatchPhase::Loading {
                    info!(skipped = stats.initial_load, "notification dispatcher live");
                }
                phase_tx.send_replace(DispatchPhase::Live);
                continue;
            }
            Decision::InitialLoad => {
                stats.initial_load += 1;
                "initial_load"
            }
            Decision::LocalEcho => {
                stats.local_echo += 1;
                "local_echo"
            }
            Decision::Emit(intent) => match sink.deliver(intent).await {
                Ok(()) => {
                    stats.emitted += 1;
                    "emitted"
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("notification delivery failed: {e}");
                    "failed"
                }
            },
        };
        metrics::counter!(NOTIFICATIONS_TOTAL, "outcome" => outcome).increment(1);
    }
    debug!(?stats, "notification dispatcher stopped");
    stats
}

// ── Dispatcher ───────────────────────────────────────────

pub struct Dispatcher {
    subscription: Subscription,
    worker: JoinHandle<DispatchStats>,
    phase: watch::Receiver<DispatchPhase>,
}

impl Dispatcher {
    /// Follow `store`'s insertion feed. Own-session detection uses `store`'s session id.
    pub fn start(
        store: &ReservationStore,
        sink: Arc<dyn NotificationSink>,
        options: DispatchOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(DispatchPhase::Loading);
        let classifier = Classifier::new(store.session_id().to_string(), options);
        let worker = tokio::spawn(run_dispatch(rx, classifier, sink, phase_tx));
        let subscription = store.on_record_added(move |insertion| {
            let _ = tx.send(insertion);
        });
        Self {
            subscription,
            worker,
            phase,
        }
    }

    pub fn phase(&self) -> DispatchPhase {
        *self.phase.borrow()
    }

    /// Resolves once the backlog has been skipped.
    pub async fn wait_live(&self) {
        let mut phase = self.phase.clone();
        // Only fails if the worker is gone, in which case there is nothing to wait for.
        let _ = phase.wait_for(|p| *p == DispatchPhase::Live).await;
    }

    /// Stop following the feed, finish queued insertions and report totals.
    pub async fn shutdown(self) -> DispatchStats {
        self.subscription.unsubscribe();
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("notification dispatcher task failed: {e}");
                DispatchStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_test::assert_ok;
    use ulid::Ulid;

    use crate::engine::{Engine, EngineConfig};
    use crate::model::*;
    use crate::store::{MemoryStore, RemoteStore};

    fn reservation(name: &str) -> Reservation {
        Reservation {
            id: Ulid::new(),
            full_name: name.into(),
            phone: "555-0100".into(),
            date: parse_date("2024-05-01").unwrap(),
            time: "19:00".into(),
            seats: 2,
            special_requests: None,
        }
    }

    fn added(name: &str, origin: Option<&str>) -> Insertion {
        Insertion::Added {
            reservation: reservation(name),
            origin: origin.map(str::to_string),
        }
    }

    fn draft(name: &str) -> ReservationDraft {
        reservation(name).to_draft()
    }

    #[test]
    fn backlog_is_never_announced() {
        let mut c = Classifier::new("me".into(), DispatchOptions::default());
        assert_eq!(c.classify(added("Ada", None)), Decision::InitialLoad);
        assert_eq!(c.classify(added("Bob", Some("other"))), Decision::InitialLoad);
        assert_eq!(c.classify(Insertion::Synced), Decision::Synced);
        assert_eq!(c.phase, DispatchPhase::Live);

        match c.classify(added("Cy", Some("other"))) {
            Decision::Emit(intent) => {
                assert_eq!(intent.title, "New reservation");
                assert_eq!(intent.body, "Cy booked for 2024-05-01");
            }
            other => panic!("expected an intent, got {other:?}"),
        }
    }

    #[test]
    fn own_writes_are_suppressed_unless_enabled() {
        let mut quiet = Classifier::new("me".into(), DispatchOptions::default());
        quiet.classify(Insertion::Synced);
        assert_eq!(quiet.classify(added("Ada", Some("me"))), Decision::LocalEcho);
        assert!(matches!(quiet.classify(added("Bob", None)), Decision::Emit(_)));

        let mut loud = Classifier::new(
            "me".into(),
            DispatchOptions {
                notify_local_writes: true,
            },
        );
        loud.classify(Insertion::Synced);
        assert!(matches!(loud.classify(added("Ada", Some("me"))), Decision::Emit(_)));
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<NotificationIntent>) -> NotificationIntent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no notification")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn zero_on_initial_load_then_one_per_external_insertion() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let front_desk = Engine::start(store.clone(), EngineConfig::default()).await.unwrap();
        for name in ["Ada", "Bob", "Cy"] {
            assert_ok!(front_desk.create_reservation(draft(name)).await);
        }

        let admin = Engine::start(store.clone(), EngineConfig::default()).await.unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let dispatcher = Dispatcher::start(admin.store(), Arc::new(sink), DispatchOptions::default());
        dispatcher.wait_live().await;
        assert_eq!(dispatcher.phase(), DispatchPhase::Live);
        assert!(rx.try_recv().is_err());

        assert_ok!(front_desk.create_reservation(draft("Dee")).await);
        let intent = next(&mut rx).await;
        assert_eq!(intent.body, "Dee booked for 2024-05-01");

        // The admin's own booking is not announced back to them.
        assert_ok!(admin.create_reservation(draft("Eve")).await);
        assert_ok!(front_desk.create_reservation(draft("Fay")).await);
        assert_eq!(next(&mut rx).await.body, "Fay booked for 2024-05-01");

        let stats = dispatcher.shutdown().await;
        assert_eq!(
            stats,
            DispatchStats {
                emitted: 2,
                initial_load: 3,
                local_echo: 1,
                failed: 0,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_local_writes_announces_own_bookings() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let admin = Engine::start(store, EngineConfig::default()).await.unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let dispatcher = Dispatcher::start(
            admin.store(),
            Arc::new(sink),
            DispatchOptions {
                notify_local_writes: true,
            },
        );
        dispatcher.wait_live().await;

        assert_ok!(admin.create_reservation(draft("Ada")).await);
        assert_eq!(next(&mut rx).await.body, "Ada booked for 2024-05-01");
        assert_eq!(dispatcher.shutdown().await.emitted, 1);
    }

    /// Fails every delivery, reporting each attempt.
    struct BrokenSink(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl NotificationSink for BrokenSink {
        async fn deliver(&self, _intent: NotificationIntent) -> Result<(), SinkError> {
            let _ = self.0.send(());
            Err("push service unavailable".into())
        }
    }

    #[tokio::test]
    async fn failed_delivery_is_counted_and_dispatch_continues() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let front_desk = Engine::start(store.clone(), EngineConfig::default()).await.unwrap();
        let admin = Engine::start(store, EngineConfig::default()).await.unwrap();
        let (attempts_tx, mut attempts) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::start(
            admin.store(),
            Arc::new(BrokenSink(attempts_tx)),
            DispatchOptions::default(),
        );
        dispatcher.wait_live().await;

        assert_ok!(front_desk.create_reservation(draft("Ada")).await);
        assert_ok!(front_desk.create_reservation(draft("Bob")).await);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), attempts.recv())
                .await
                .expect("delivery attempted");
        }
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.emitted, 0);
    }

    #[tokio::test]
    async fn log_sink_accepts_intents() {
        let intent = NotificationIntent::new_reservation(&reservation("Ada"));
        assert_ok!(LogSink.deliver(intent).await);
    }
}
