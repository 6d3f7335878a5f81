use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{record_mutation, CAPACITY_VIOLATIONS_TOTAL, VALIDATION_REJECTIONS_TOTAL};

use super::state::LocalChange;
use super::validation::{capacity_check, seats_booked, validate_draft};
use super::{CapacityExceeded, CapacityPolicy, Engine, EngineError, ValidationError, WriteReceipt};

fn rejected(e: ValidationError) -> EngineError {
    metrics::counter!(VALIDATION_REJECTIONS_TOTAL, "reason" => e.reason()).increment(1);
    e.into()
}

impl Engine {
    pub async fn create_reservation(
        &self,
        draft: ReservationDraft,
    ) -> Result<WriteReceipt, EngineError> {
        let start = Instant::now();
        let result = self.create_inner(draft).await;
        record_mutation("create", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// Full replace of the reservation's fields.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        draft: ReservationDraft,
    ) -> Result<WriteReceipt, EngineError> {
        let start = Instant::now();
        let result = self.update_inner(id, draft).await;
        record_mutation("update", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// Idempotent: removing an unknown id succeeds.
    pub async fn remove_reservation(&self, id: Ulid) -> Result<Revision, EngineError> {
        let start = Instant::now();
        let result = self.remove_inner(id).await;
        record_mutation("remove", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// Flip a shift's `enabled` flag and return the shift as stored afterwards.
    /// A shift that was never written counts as disabled.
    pub async fn toggle_shift_enabled(&self, date: &Date, time: &str) -> Result<Shift, EngineError> {
        let start = Instant::now();
        let result = self.toggle_inner(date, time).await;
        record_mutation("toggle_shift", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    pub async fn set_shift_capacity(
        &self,
        date: &Date,
        time: &str,
        max_reservations: u32,
    ) -> Result<Shift, EngineError> {
        let start = Instant::now();
        let result = self.patch_shift(date, time, ShiftPatch::capacity(max_reservations)).await;
        record_mutation("shift_capacity", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    // ── Internals ────────────────────────────────────────

    async fn create_inner(&self, draft: ReservationDraft) -> Result<WriteReceipt, EngineError> {
        let draft = draft.normalized();
        validate_draft(&draft, self.registry.slot_template()).map_err(rejected)?;

        let _guard = self.write_lock.lock().await;
        let shift = self.open_shift(&draft.date, &draft.time).await?;
        let booked = seats_booked(self.shared.read().iter(), &draft.date, &draft.time, None);
        let capacity = self.enforce_capacity(&draft.date, &shift, booked, draft.seats)?;

        let created = self.store.create(&draft).await?;
        let reservation = Reservation::from_draft(created.id, draft);
        info!(
            id = %created.id,
            date = %reservation.date,
            time = %reservation.time,
            seats = reservation.seats,
            revision = created.revision,
            "reservation created"
        );
        self.shared
            .reflect(created.id, created.revision, LocalChange::Upsert(reservation));
        Ok(WriteReceipt {
            id: created.id,
            revision: created.revision,
            capacity,
        })
    }

    async fn update_inner(
        &self,
        id: Ulid,
        draft: ReservationDraft,
    ) -> Result<WriteReceipt, EngineError> {
        let draft = draft.normalized();
        validate_draft(&draft, self.registry.slot_template()).map_err(rejected)?;

        let _guard = self.write_lock.lock().await;
        let current = self.shared.read().get(&id).cloned();
        let moved = current
            .as_ref()
            .is_none_or(|c| !c.in_slot(&draft.date, &draft.time));

        let mut capacity = None;
        let grows = moved || current.as_ref().is_some_and(|c| draft.seats > c.seats);
        if grows {
            let shift = if moved {
                self.open_shift(&draft.date, &draft.time).await?
            } else {
                self.registry.ensure_shift(&draft.date, &draft.time).await?
            };
            let booked = seats_booked(self.shared.read().iter(), &draft.date, &draft.time, Some(id));
            capacity = self.enforce_capacity(&draft.date, &shift, booked, draft.seats)?;
        }

        let reservation = Reservation::from_draft(id, draft);
        let revision = self.store.update(&reservation).await?;
        info!(id = %id, revision, moved, "reservation updated");
        self.shared.reflect(id, revision, LocalChange::Upsert(reservation));
        Ok(WriteReceipt {
            id,
            revision,
            capacity,
        })
    }

    async fn remove_inner(&self, id: Ulid) -> Result<Revision, EngineError> {
        let _guard = self.write_lock.lock().await;
        let revision = self.store.remove(id).await?;
        info!(id = %id, revision, "reservation removed");
        self.shared.reflect(id, revision, LocalChange::Remove);
        Ok(revision)
    }

    async fn toggle_inner(&self, date: &Date, time: &str) -> Result<Shift, EngineError> {
        if !self.registry.is_slot(time) {
            return Err(EngineError::SlotNotFound(time.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let current = match self.registry.shift(date, time).await? {
            Some(shift) => shift,
            None => Shift {
                time: time.to_string(),
                enabled: false,
                max_reservations: self.registry.defaults().max_reservations,
            },
        };
        let fresh = self
            .write_shift(date, time, ShiftPatch::enabled(!current.enabled))
            .await?;
        info!(date = %date, time, enabled = fresh.enabled, "shift toggled");
        Ok(fresh)
    }

    async fn patch_shift(&self, date: &Date, time: &str, patch: ShiftPatch) -> Result<Shift, EngineError> {
        let _guard = self.write_lock.lock().await;
        let fresh = self.write_shift(date, time, patch).await?;
        info!(date = %date, time, max = fresh.max_reservations, "shift capacity set");
        Ok(fresh)
    }

    /// Caller holds the write lock.
    async fn write_shift(&self, date: &Date, time: &str, patch: ShiftPatch) -> Result<Shift, EngineError> {
        self.registry
            .update_shift(date, time, patch)
            .await
            .map_err(|e| match e {
                EngineError::Validation(v) => rejected(v),
                other => other,
            })?;
        self.registry
            .shift(date, time)
            .await?
            .ok_or_else(|| EngineError::SlotNotFound(time.to_string()))
    }

    /// The target shift, materialized if needed. Must be accepting reservations.
    async fn open_shift(&self, date: &Date, time: &str) -> Result<Shift, EngineError> {
        let shift = self.registry.ensure_shift(date, time).await?;
        if !shift.enabled {
            return Err(rejected(ValidationError::ShiftDisabled {
                date: *date,
                time: time.to_string(),
            }));
        }
        Ok(shift)
    }

    fn enforce_capacity(
        &self,
        date: &Date,
        shift: &Shift,
        booked: u32,
        requested: u32,
    ) -> Result<Option<CapacityExceeded>, EngineError> {
        let Some(violation) = capacity_check(date, shift, booked, requested) else {
            return Ok(None);
        };
        metrics::counter!(CAPACITY_VIOLATIONS_TOTAL, "policy" => self.policy.label()).increment(1);
        match self.policy {
            CapacityPolicy::Reject => Err(EngineError::CapacityExceeded(violation)),
            CapacityPolicy::Warn => {
                warn!("{violation}; writing anyway");
                Ok(Some(violation))
            }
        }
    }
}
