use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar date of a reservation or a shift set.
pub type Date = NaiveDate;

/// Per-collection write counter assigned by the store. Strictly increasing.
pub type Revision = u64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Option<Date> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: &Date) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ── Reservations ─────────────────────────────────────────────────

/// A reservation before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub full_name: String,
    pub phone: String,
    pub date: Date,
    /// Slot identifier (`HH:MM`), one of the registry template values.
    pub time: String,
    pub seats: u32,
    pub special_requests: Option<String>,
}

impl ReservationDraft {
    /// Trim text fields and fold an empty `special_requests` into `None`.
    pub fn normalized(mut self) -> Self {
        self.full_name = self.full_name.trim().to_string();
        self.phone = self.phone.trim().to_string();
        self.time = self.time.trim().to_string();
        self.special_requests = self
            .special_requests
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub full_name: String,
    pub phone: String,
    pub date: Date,
    pub time: String,
    pub seats: u32,
    pub special_requests: Option<String>,
}

impl Reservation {
    pub fn from_draft(id: Ulid, draft: ReservationDraft) -> Self {
        Self {
            id,
            full_name: draft.full_name,
            phone: draft.phone,
            date: draft.date,
            time: draft.time,
            seats: draft.seats,
            special_requests: draft.special_requests,
        }
    }

    pub fn to_draft(&self) -> ReservationDraft {
        ReservationDraft {
            full_name: self.full_name.clone(),
            phone: self.phone.clone(),
            date: self.date,
            time: self.time.clone(),
            seats: self.seats,
            special_requests: self.special_requests.clone(),
        }
    }

    pub fn in_slot(&self, date: &Date, time: &str) -> bool {
        self.date == *date && self.time == time
    }
}

/// Client-perceived lifecycle of a reservation that exists in the canonical view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Acknowledged by the store, not yet confirmed by a snapshot.
    Pending,
    /// Present in the last applied snapshot.
    Committed,
}

/// Full contents of the `reservations` collection at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: Revision,
    pub reservations: Vec<Reservation>,
}

// ── Shifts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub time: String,
    pub enabled: bool,
    pub max_reservations: u32,
}

/// Partial update for a shift; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShiftPatch {
    pub enabled: Option<bool>,
    pub max_reservations: Option<u32>,
}

impl ShiftPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            max_reservations: None,
        }
    }

    pub fn capacity(max_reservations: u32) -> Self {
        Self {
            enabled: None,
            max_reservations: Some(max_reservations),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.max_reservations.is_none()
    }
}

/// Seats booked in one slot against its ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftLoad {
    pub time: String,
    pub enabled: bool,
    pub booked_seats: u32,
    pub max_reservations: u32,
}

impl ShiftLoad {
    pub fn remaining(&self) -> u32 {
        self.max_reservations.saturating_sub(self.booked_seats)
    }

    pub fn is_over_capacity(&self) -> bool {
        self.booked_seats > self.max_reservations
    }
}

// ── Notifications ────────────────────────────────────────────────

/// What to tell an admin about a new reservation. Delivery is someone else's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub title: String,
    pub body: String,
}

impl NotificationIntent {
    pub fn new_reservation(reservation: &Reservation) -> Self {
        Self {
            title: "New reservation".to_string(),
            body: format!(
                "{} booked for {}",
                reservation.full_name,
                format_date(&reservation.date)
            ),
        }
    }
}

// ── Store records ────────────────────────────────────────────────

/// A single value in a flat store record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl Field {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Field::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Text(s.to_string())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Text(s)
    }
}

impl From<i64> for Field {
    fn from(n: i64) -> Self {
        Field::Int(n)
    }
}

impl From<bool> for Field {
    fn from(b: bool) -> Self {
        Field::Bool(b)
    }
}

/// Flat field map, the only shape the store knows about.
pub type Record = BTreeMap<String, Field>;

/// A store mutation as written to the WAL. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RecordPut {
        path: String,
        key: String,
        record: Record,
    },
    RecordRemoved {
        path: String,
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

/// Live change-feed entry for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub key: String,
    pub kind: ChangeKind,
    pub revision: Revision,
    /// Record contents after the change; `None` for removals.
    pub record: Option<Record>,
}
