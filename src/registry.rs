use std::sync::Arc;

use chrono::NaiveTime;
use tracing::{debug, info, warn};

use crate::codec::{decode_shift, encode_shift, encode_shift_patch};
use crate::engine::{EngineError, ValidationError};
use crate::limits::{DEFAULT_MAX_RESERVATIONS, MAX_SHIFT_CAPACITY};
use crate::model::*;
use crate::observability::RECORDS_SKIPPED_TOTAL;
use crate::store::{shifts_path, RemoteStore, WriteMode};

/// Lunch 12:00 to 14:30 and dinner 19:00 to 22:30, every half hour.
pub fn default_slots() -> Vec<String> {
    let lunch = (12..=14).flat_map(|h| [format!("{h:02}:00"), format!("{h:02}:30")]);
    let dinner = (19..=22).flat_map(|h| [format!("{h:02}:00"), format!("{h:02}:30")]);
    lunch.chain(dinner).collect()
}

/// Canonical `HH:MM` form of a 24h time, or `None` if it isn't one.
pub fn parse_slot(s: &str) -> Option<String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .ok()
        .map(|t| t.format("%H:%M").to_string())
}

/// What a slot looks like before anyone has configured it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftDefaults {
    pub enabled: bool,
    pub max_reservations: u32,
}

impl Default for ShiftDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reservations: DEFAULT_MAX_RESERVATIONS,
        }
    }
}

/// The fixed slot template plus per-date shift records in the store.
pub struct ShiftRegistry {
    store: Arc<dyn RemoteStore>,
    slots: Vec<String>,
    defaults: ShiftDefaults,
}

impl ShiftRegistry {
    pub fn new(store: Arc<dyn RemoteStore>, slots: Vec<String>, defaults: ShiftDefaults) -> Self {
        Self {
            store,
            slots,
            defaults,
        }
    }

    pub fn slot_template(&self) -> &[String] {
        &self.slots
    }

    pub fn is_slot(&self, time: &str) -> bool {
        self.slots.iter().any(|s| s == time)
    }

    pub fn defaults(&self) -> ShiftDefaults {
        self.defaults
    }

    pub fn default_shift(&self, time: &str) -> Shift {
        Shift {
            time: time.to_string(),
            enabled: self.defaults.enabled,
            max_reservations: self.defaults.max_reservations,
        }
    }

    /// Persisted shifts for `date` in template order. Empty if the date was never initialized.
/// Shifts for times outside the template follow, in time order.
    pub async fn shifts_for_date(&self, date: &Date) -> Result<Vec<Shift>, EngineError> {
        let snapshot = self.store.read(&shifts_path(date)).await?;
        let mut shifts = Vec::with_capacity(snapshot.records.len());
        for (time, record) in &snapshot.records {
            match decode_shift(time, record, &self.default_shift(time)) {
                Ok(shift) => shifts.push(shift),
                Err(e) => {
                    warn!(date = %date, time = %time, "skipping shift record: {e}");
                    metrics::counter!(RECORDS_SKIPPED_TOTAL, "collection" => "shifts").increment(1);
                }
            }
        }
        // Stable: off-template times keep the store's `HH:MM` order at the end.
        shifts.sort_by_key(|s| {
            self.slots
                .iter()
                .position(|t| *t == s.time)
                .unwrap_or(usize::MAX)
        });
        Ok(shifts)
    }

    pub async fn shift(&self, date: &Date, time: &str) -> Result<Option<Shift>, EngineError> {
        Ok(self
            .shifts_for_date(date)
            .await?
            .into_iter()
            .find(|s| s.time == time))
    }

    /// Write the full template with defaults, only if `date` has no shifts yet.
    pub async fn initialize_shifts_for_date(&self, date: &Date) -> Result<(), EngineError> {
        let path = shifts_path(date);
        if !self.store.read(&path).await?.records.is_empty() {
            debug!(date = %date, "shifts already initialized");
            return Ok(());
        }
        for time in &self.slots {
            // IfAbsent: a concurrent session may have initialized and toggled meanwhile.
            self.store
                .put(&path, time, encode_shift(&self.default_shift(time)), WriteMode::IfAbsent)
                .await?;
        }
        info!(date = %date, slots = self.slots.len(), "shifts initialized");
        Ok(())
    }

    /// Read the date's shifts, initializing them first if there are none.
    pub async fn ensure_shifts_for_date(&self, date: &Date) -> Result<Vec<Shift>, EngineError> {
        let shifts = self.shifts_for_date(date).await?;
        if !shifts.is_empty() {
            return Ok(shifts);
        }
        self.initialize_shifts_for_date(date).await?;
        self.shifts_for_date(date).await
    }

    /// The shift for one slot, materializing the date (and the slot) if needed.
    pub async fn ensure_shift(&self, date: &Date, time: &str) -> Result<Shift, EngineError> {
        if !self.is_slot(time) {
            return Err(ValidationError::UnknownSlot(time.to_string()).into());
        }
        if let Some(shift) = self
            .ensure_shifts_for_date(date)
            .await?
            .into_iter()
            .find(|s| s.time == time)
        {
            return Ok(shift);
        }
        // The template grew after this date was initialized.
        let shift = self.default_shift(time);
        self.store
            .put(&shifts_path(date), time, encode_shift(&shift), WriteMode::IfAbsent)
            .await?;
        Ok(self.shift(date, time).await?.unwrap_or(shift))
    }

    /// Merge `patch` into the slot's shift, synthesizing the default shift first if absent.
    pub async fn update_shift(
        &self,
        date: &Date,
        time: &str,
        patch: ShiftPatch,
    ) -> Result<(), EngineError> {
        if !self.is_slot(time) {
            return Err(EngineError::SlotNotFound(time.to_string()));
        }
        if let Some(max) = patch.max_reservations
            && !(1..=MAX_SHIFT_CAPACITY).contains(&max)
        {
            return Err(ValidationError::InvalidCapacity(max).into());
        }
        if patch.is_empty() {
            return Ok(());
        }
        let path = shifts_path(date);
        self.store
            .put(&path, time, encode_shift(&self.default_shift(time)), WriteMode::IfAbsent)
            .await?;
        self.store
            .put(&path, time, encode_shift_patch(&patch), WriteMode::Merge)
            .await?;
        debug!(date = %date, time, ?patch, "shift updated");
        Ok(())
    }
}
