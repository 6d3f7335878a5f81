use ulid::Ulid;

use crate::codec::{FULL_NAME, PHONE, SPECIAL_REQUESTS, TIME};
use crate::limits::*;
use crate::model::*;

use super::error::{CapacityExceeded, ValidationError};

fn check_text(
    value: &str,
    field: &'static str,
    max: usize,
    required: bool,
) -> Result<(), ValidationError> {
    if required && value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field, max });
    }
    Ok(())
}

/// Field-level checks on an already normalized draft. No I/O.
pub(crate) fn validate_draft(
    draft: &ReservationDraft,
    slots: &[String],
) -> Result<(), ValidationError> {
    check_text(&draft.full_name, FULL_NAME, MAX_NAME_LEN, true)?;
    check_text(&draft.phone, PHONE, MAX_PHONE_LEN, true)?;
    if draft.time.is_empty() {
        return Err(ValidationError::EmptyField(TIME));
    }
    if let Some(requests) = &draft.special_requests {
        check_text(requests, SPECIAL_REQUESTS, MAX_REQUESTS_LEN, false)?;
    }
    if !(MIN_SEATS..=MAX_SEATS).contains(&draft.seats) {
        return Err(ValidationError::SeatsOutOfRange(draft.seats));
    }
    if !slots.iter().any(|s| *s == draft.time) {
        return Err(ValidationError::UnknownSlot(draft.time.clone()));
    }
    Ok(())
}

/// Seats booked in `(date, time)`, not counting `exclude`. Saturates, since
/// records from other sessions are not range-checked.
pub(crate) fn seats_booked<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    date: &Date,
    time: &str,
    exclude: Option<Ulid>,
) -> u32 {
    reservations
        .into_iter()
        .filter(|r| r.in_slot(date, time) && Some(r.id) != exclude)
        .fold(0u32, |total, r| total.saturating_add(r.seats))
}

/// `Some` if adding `requested` seats would push the shift past its ceiling.
pub(crate) fn capacity_check(
    date: &Date,
    shift: &Shift,
    booked: u32,
    requested: u32,
) -> Option<CapacityExceeded> {
    (booked.saturating_add(requested) > shift.max_reservations).then(|| CapacityExceeded {
        date: *date,
        time: shift.time.clone(),
        booked,
        requested,
        max: shift.max_reservations,
    })
}
