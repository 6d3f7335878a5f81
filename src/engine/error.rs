use ulid::Ulid;

use crate::model::{format_date, Date};
use crate::store::StoreError;

/// Input the engine refuses before touching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyField(&'static str),
    FieldTooLong { field: &'static str, max: usize },
    SeatsOutOfRange(u32),
    UnknownSlot(String),
    ShiftDisabled { date: Date, time: String },
    InvalidCapacity(u32),
}

impl ValidationError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyField(_) => "empty_field",
            ValidationError::FieldTooLong { .. } => "field_too_long",
            ValidationError::SeatsOutOfRange(_) => "seats_out_of_range",
            ValidationError::UnknownSlot(_) => "unknown_slot",
            ValidationError::ShiftDisabled { .. } => "shift_disabled",
            ValidationError::InvalidCapacity(_) => "invalid_capacity",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyField(field) => write!(f, "{field} must not be empty"),
            ValidationError::FieldTooLong { field, max } => {
                write!(f, "{field} longer than {max} characters")
            }
            ValidationError::SeatsOutOfRange(seats) => {
                write!(f, "seats must be between 1 and 8, got {seats}")
            }
            ValidationError::UnknownSlot(time) => write!(f, "{time} is not a bookable time slot"),
            ValidationError::ShiftDisabled { date, time } => {
                write!(f, "shift {} {time} is not accepting reservations", format_date(date))
            }
            ValidationError::InvalidCapacity(n) => write!(f, "invalid shift capacity: {n}"),
        }
    }
}

/// A slot would hold more seats than its ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub date: Date,
    pub time: String,
    /// Seats already booked in the slot, excluding the reservation being written.
    pub booked: u32,
    pub requested: u32,
    pub max: u32,
}

impl std::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shift {} {} over capacity: {} booked + {} requested > {}",
            format_date(&self.date),
            self.time,
            self.booked,
            self.requested,
            self.max
        )
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    ReservationNotFound(Ulid),
    SlotNotFound(String),
    CapacityExceeded(CapacityExceeded),
    Read(String),
    Write(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ReservationNotFound(_) | EngineError::SlotNotFound(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "invalid reservation: {e}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::SlotNotFound(time) => write!(f, "time slot not found: {time}"),
            EngineError::CapacityExceeded(e) => write!(f, "{e}"),
            EngineError::Read(e) => write!(f, "read error: {e}"),
            EngineError::Write(e) => write!(f, "write error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { key, .. } => match Ulid::from_string(&key) {
                Ok(id) => EngineError::ReservationNotFound(id),
                Err(_) => EngineError::SlotNotFound(key),
            },
            StoreError::Read(e) => EngineError::Read(e),
            StoreError::Write(e) => EngineError::Write(e),
        }
    }
}
