mod error;
mod mutations;
mod queries;
mod state;
mod validation;

pub use error::{CapacityExceeded, EngineError, ValidationError};
pub use state::CanonicalState;

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use tokio::sync::watch;
use tracing::{debug, info};
use ulid::Ulid;

use crate::adapter::{ReservationStore, Subscription};
use crate::config::Config;
use crate::model::*;
use crate::observability::{RESERVATIONS_CANONICAL, SNAPSHOTS_APPLIED_TOTAL, SNAPSHOTS_STALE_TOTAL};
use crate::registry::{ShiftDefaults, ShiftRegistry};
use crate::store::RemoteStore;

use state::{LocalChange, SnapshotOutcome};

/// What to do when a write would push a shift past `max_reservations`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Refuse the write with [`EngineError::CapacityExceeded`].
    #[default]
    Reject,
    /// Write anyway; the breach is reported in the [`WriteReceipt`].
    Warn,
}

impl CapacityPolicy {
    fn label(self) -> &'static str {
        match self {
            CapacityPolicy::Reject => "reject",
            CapacityPolicy::Warn => "warn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub slots: Vec<String>,
    pub shift_defaults: ShiftDefaults,
    pub capacity_policy: CapacityPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            slots: config.slots.clone(),
            shift_defaults: config.shift_defaults,
            capacity_policy: config.capacity_policy,
        }
    }
}

/// Outcome of an acknowledged reservation write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub id: Ulid,
    pub revision: Revision,
    /// Set when the write went through over capacity under [`CapacityPolicy::Warn`].
    pub capacity: Option<CapacityExceeded>,
}

/// Read-only view handed to UI watchers. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct View {
    /// Bumped on every visible change.
    pub version: u64,
    /// Revision of the last applied snapshot; `None` before the first one.
    pub revision: Option<Revision>,
    /// Sorted by date, time, name.
    pub reservations: Arc<Vec<Reservation>>,
}

impl View {
    pub fn for_date(&self, date: &Date) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|r| r.date == *date)
            .cloned()
            .collect()
    }
}

// ── Shared state ─────────────────────────────────────────

/// State reachable from both the snapshot feed and mutation paths.
/// All changes go through `apply_snapshot` or `reflect`.
struct Shared {
    state: RwLock<CanonicalState>,
    view_tx: watch::Sender<View>,
}

impl Shared {
    fn new() -> Self {
        let (view_tx, _) = watch::channel(View::default());
        Self {
            state: RwLock::new(CanonicalState::new()),
            view_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CanonicalState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_snapshot(&self, snapshot: Snapshot) {
        let revision = snapshot.revision;
        let count = snapshot.reservations.len();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.apply_snapshot(snapshot) {
            SnapshotOutcome::Applied => {
                metrics::counter!(SNAPSHOTS_APPLIED_TOTAL).increment(1);
                debug!(revision, count, pending = state.pending_count(), "snapshot applied");
                self.publish(&state);
            }
            SnapshotOutcome::Stale => {
                metrics::counter!(SNAPSHOTS_STALE_TOTAL).increment(1);
                debug!(revision, current = ?state.revision(), "stale snapshot ignored");
            }
        }
    }

    fn reflect(&self, id: Ulid, revision: Revision, change: LocalChange) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.version();
        state.reflect(id, revision, change);
        if state.version() != before {
            self.publish(&state);
        }
    }

    fn publish(&self, state: &CanonicalState) {
        let reservations = state.sorted();
        metrics::gauge!(RESERVATIONS_CANONICAL).set(reservations.len() as f64);
        self.view_tx.send_replace(View {
            version: state.version(),
            revision: state.revision(),
            reservations: Arc::new(reservations),
        });
    }
}

// ── Engine ───────────────────────────────────────────────

/// Owns the canonical reservation state for one admin session and is the only
/// path through which that session writes.
pub struct Engine {
    store: ReservationStore,
    registry: ShiftRegistry,
    policy: CapacityPolicy,
    shared: Arc<Shared>,
    /// Serializes check-then-write for every mutation.
    write_lock: tokio::sync::Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
}

impl Engine {
    /// An engine that has not loaded anything yet. See [`Engine::start`].
    pub fn new(store: Arc<dyn RemoteStore>, config: EngineConfig) -> Self {
        let registry = ShiftRegistry::new(store.clone(), config.slots, config.shift_defaults);
        Self {
            store: ReservationStore::new(store),
            registry,
            policy: config.capacity_policy,
            shared: Arc::new(Shared::new()),
            write_lock: tokio::sync::Mutex::new(()),
            subscription: Mutex::new(None),
        }
    }

    /// Load the current reservations and keep following the store.
    pub async fn start(store: Arc<dyn RemoteStore>, config: EngineConfig) -> Result<Self, EngineError> {
        let engine = Self::new(store, config);
        engine.resync().await?;
        engine.follow();
        info!(
            session = engine.store.session_id(),
            reservations = engine.shared.read().len(),
            policy = engine.policy.label(),
            "engine started"
        );
        Ok(engine)
    }

    /// Apply a fresh full read. Older than the current state is a no-op.
    pub async fn resync(&self) -> Result<(), EngineError> {
        let snapshot = self.store.snapshot().await?;
        self.shared.apply_snapshot(snapshot);
        Ok(())
    }

    fn follow(&self) {
        let shared = self.shared.clone();
        let subscription = self.store.subscribe(move |snapshot| shared.apply_snapshot(snapshot));
        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscription);
        drop(previous);
    }

    pub fn is_following(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Stop following the store. The last view stays readable.
    pub fn shutdown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            info!(session = self.store.session_id(), "engine stopped");
        }
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    pub fn registry(&self) -> &ShiftRegistry {
        &self.registry
    }

    pub fn capacity_policy(&self) -> CapacityPolicy {
        self.policy
    }

    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
