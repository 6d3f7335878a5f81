use tokio::sync::watch;
use ulid::Ulid;

use crate::model::*;

use super::validation::seats_booked;
use super::{Engine, EngineError, View};

impl Engine {
    /// Reservations on `date`, sorted by time then name.
    pub fn reservations_for_date(&self, date: &Date) -> Vec<Reservation> {
        self.shared.read().for_date(date)
    }

    /// Every reservation, sorted by date, time, name.
    pub fn reservations(&self) -> Vec<Reservation> {
        self.shared.read().sorted()
    }

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.shared.read().get(id).cloned()
    }

    /// `None` if the reservation is not in the canonical view.
    pub fn phase(&self, id: &Ulid) -> Option<Phase> {
        self.shared.read().phase(id)
    }

    /// Revision of the last applied snapshot.
    pub fn revision(&self) -> Option<Revision> {
        self.shared.read().revision()
    }

    /// Receives a new [`View`] after every visible change.
    pub fn watch(&self) -> watch::Receiver<View> {
        self.shared.view_tx.subscribe()
    }

    /// The date's shifts, initialized from the template if the date has none.
    pub async fn shifts_for_date(&self, date: &Date) -> Result<Vec<Shift>, EngineError> {
        self.registry.ensure_shifts_for_date(date).await
    }

    /// Seats booked against each shift's ceiling on `date`.
    pub async fn shift_load(&self, date: &Date) -> Result<Vec<ShiftLoad>, EngineError> {
        let shifts = self.shifts_for_date(date).await?;
        let state = self.shared.read();
        Ok(shifts
            .into_iter()
            .map(|shift| ShiftLoad {
                booked_seats: seats_booked(state.iter(), date, &shift.time, None),
                time: shift.time,
                enabled: shift.enabled,
                max_reservations: shift.max_reservations,
            })
            .collect())
    }

    /// Shifts on `date` currently holding more seats than they allow.
    pub async fn capacity_violations(&self, date: &Date) -> Result<Vec<ShiftLoad>, EngineError> {
        Ok(self
            .shift_load(date)
            .await?
            .into_iter()
            .filter(ShiftLoad::is_over_capacity)
            .collect())
    }
}
