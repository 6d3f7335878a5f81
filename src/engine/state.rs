use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;

/// A local write the store acknowledged at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LocalChange {
    Upsert(Reservation),
    Remove,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    revision: Revision,
    change: LocalChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SnapshotOutcome {
    Applied,
    /// Older than the snapshot already applied; ignored.
    Stale,
}

/// The engine's authoritative view of every reservation.
///
/// Two layers: the last applied snapshot (`Committed`), and acknowledged local
/// writes the snapshot does not cover yet (`Pending`). A snapshot at or past a
/// pending write's revision already reflects that write, or something newer
/// from another session, so it retires the pending entry. The remote state wins.
#[derive(Debug, Default)]
pub struct CanonicalState {
    committed: BTreeMap<Ulid, Reservation>,
    revision: Option<Revision>,
    pending: BTreeMap<Ulid, PendingWrite>,
    /// Bumped on every visible change.
    version: u64,
}

impl CanonicalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision of the last applied snapshot.
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Replace the committed layer wholesale with `snapshot`.
    pub(crate) fn apply_snapshot(&mut self, snapshot: Snapshot) -> SnapshotOutcome {
        if let Some(current) = self.revision
            && snapshot.revision < current
        {
            return SnapshotOutcome::Stale;
        }
        let revision = snapshot.revision;
        self.committed = snapshot
            .reservations
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        self.revision = Some(revision);
        self.pending.retain(|_, w| w.revision > revision);
        self.version += 1;
        SnapshotOutcome::Applied
    }

    /// Reflect an acknowledged local write until a snapshot catches up with it.
    pub(crate) fn reflect(&mut self, id: Ulid, revision: Revision, change: LocalChange) {
        if let Some(current) = self.revision
            && revision <= current
        {
            // The applied snapshot already includes this write or supersedes it.
            return;
        }
        if let Some(existing) = self.pending.get(&id)
            && existing.revision > revision
        {
            return;
        }
        self.pending.insert(id, PendingWrite { revision, change });
        self.version += 1;
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        match self.pending.get(id) {
            Some(PendingWrite {
                change: LocalChange::Upsert(r),
                ..
            }) => Some(r),
            Some(PendingWrite {
                change: LocalChange::Remove,
                ..
            }) => None,
            None => self.committed.get(id),
        }
    }

    pub fn phase(&self, id: &Ulid) -> Option<Phase> {
        match self.pending.get(id) {
            Some(PendingWrite {
                change: LocalChange::Upsert(_),
                ..
            }) => Some(Phase::Pending),
            Some(PendingWrite {
                change: LocalChange::Remove,
                ..
            }) => None,
            None => self.committed.contains_key(id).then_some(Phase::Committed),
        }
    }

    /// Every visible reservation, committed then pending, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        let committed = self
            .committed
            .iter()
            .filter(|(id, _)| !self.pending.contains_key(id))
            .map(|(_, r)| r);
        let pending = self.pending.values().filter_map(|w| match &w.change {
            LocalChange::Upsert(r) => Some(r),
            LocalChange::Remove => None,
        });
        committed.chain(pending)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible reservations sorted by date, slot, name.
    pub fn sorted(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.iter().cloned().collect();
        all.sort_by(|a, b| {
            (a.date, &a.time, &a.full_name, a.id).cmp(&(b.date, &b.time, &b.full_name, b.id))
        });
        all
    }

    pub fn for_date(&self, date: &Date) -> Vec<Reservation> {
        let mut day: Vec<Reservation> = self.iter().filter(|r| r.date == *date).cloned().collect();
        day.sort_by(|a, b| (&a.time, &a.full_name, a.id).cmp(&(&b.time, &b.full_name, b.id)));
        day
    }
}
