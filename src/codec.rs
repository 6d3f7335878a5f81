//! Flat store records <-> entities.

use ulid::Ulid;

use crate::model::*;

pub const FULL_NAME: &str = "fullName";
pub const PHONE: &str = "phone";
pub const DATE: &str = "date";
pub const TIME: &str = "time";
pub const SEATS: &str = "seats";
pub const SPECIAL_REQUESTS: &str = "specialRequests";
/// Session that created the record. Adapter metadata, not part of the entity.
pub const ORIGIN: &str = "origin";

pub const ENABLED: &str = "enabled";
pub const MAX_RESERVATIONS: &str = "maxReservations";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    BadKey(String),
    Missing(&'static str),
    WrongType(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadKey(key) => write!(f, "record key is not an id: {key}"),
            DecodeError::Missing(field) => write!(f, "missing field {field}"),
            DecodeError::WrongType(field) => write!(f, "field {field} has the wrong type"),
            DecodeError::BadValue(field, v) => write!(f, "field {field} has invalid value {v}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn text<'a>(record: &'a Record, field: &'static str) -> Result<&'a str, DecodeError> {
    record
        .get(field)
        .ok_or(DecodeError::Missing(field))?
        .as_text()
        .ok_or(DecodeError::WrongType(field))
}

fn int(record: &Record, field: &'static str) -> Result<i64, DecodeError> {
    record
        .get(field)
        .ok_or(DecodeError::Missing(field))?
        .as_int()
        .ok_or(DecodeError::WrongType(field))
}

pub fn encode_reservation(draft: &ReservationDraft, origin: Option<&str>) -> Record {
    let mut record = Record::new();
    record.insert(FULL_NAME.into(), Field::from(draft.full_name.as_str()));
    record.insert(PHONE.into(), Field::from(draft.phone.as_str()));
    record.insert(DATE.into(), Field::from(format_date(&draft.date)));
    record.insert(TIME.into(), Field::from(draft.time.as_str()));
    record.insert(SEATS.into(), Field::Int(i64::from(draft.seats)));
    if let Some(requests) = &draft.special_requests {
        record.insert(SPECIAL_REQUESTS.into(), Field::from(requests.as_str()));
    }
    if let Some(origin) = origin {
        record.insert(ORIGIN.into(), Field::from(origin));
    }
    record
}

/// Decode without range checks: whatever another session managed to store is
/// reported as-is so capacity checks can see it.
pub fn decode_reservation(key: &str, record: &Record) -> Result<Reservation, DecodeError> {
    let id = Ulid::from_string(key).map_err(|_| DecodeError::BadKey(key.to_string()))?;
    let date_raw = text(record, DATE)?;
    let date = parse_date(date_raw).ok_or_else(|| DecodeError::BadValue(DATE, date_raw.into()))?;
    let seats_raw = int(record, SEATS)?;
    let seats =
        u32::try_from(seats_raw).map_err(|_| DecodeError::BadValue(SEATS, seats_raw.to_string()))?;
    let special_requests = match record.get(SPECIAL_REQUESTS) {
        None => None,
        Some(field) => {
            let s = field.as_text().ok_or(DecodeError::WrongType(SPECIAL_REQUESTS))?;
            (!s.is_empty()).then(|| s.to_string())
        }
    };
    Ok(Reservation {
        id,
        full_name: text(record, FULL_NAME)?.to_string(),
        phone: text(record, PHONE)?.to_string(),
        date,
        time: text(record, TIME)?.to_string(),
        seats,
        special_requests,
    })
}

pub fn record_origin(record: &Record) -> Option<&str> {
    record.get(ORIGIN).and_then(Field::as_text)
}

/// Shift records are keyed by slot time, so the time is not repeated inside.
pub fn encode_shift(shift: &Shift) -> Record {
    let mut record = Record::new();
    record.insert(ENABLED.into(), Field::Bool(shift.enabled));
    record.insert(MAX_RESERVATIONS.into(), Field::Int(i64::from(shift.max_reservations)));
    record
}

pub fn encode_shift_patch(patch: &ShiftPatch) -> Record {
    let mut record = Record::new();
    if let Some(enabled) = patch.enabled {
        record.insert(ENABLED.into(), Field::Bool(enabled));
    }
    if let Some(max) = patch.max_reservations {
        record.insert(MAX_RESERVATIONS.into(), Field::Int(i64::from(max)));
    }
    record
}

/// Missing fields take `fallback`'s value; fields of the wrong type are an error.
pub fn decode_shift(key: &str, record: &Record, fallback: &Shift) -> Result<Shift, DecodeError> {
    let enabled = match record.get(ENABLED) {
        None => fallback.enabled,
        Some(f) => f.as_bool().ok_or(DecodeError::WrongType(ENABLED))?,
    };
    let max_reservations = match record.get(MAX_RESERVATIONS) {
        None => fallback.max_reservations,
        Some(f) => {
            let n = f.as_int().ok_or(DecodeError::WrongType(MAX_RESERVATIONS))?;
            u32::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| DecodeError::BadValue(MAX_RESERVATIONS, n.to_string()))?
        }
    };
    Ok(Shift {
        time: key.to_string(),
        enabled,
        max_reservations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ReservationDraft {
        ReservationDraft {
            full_name: "Luca Bianchi".into(),
            phone: "+39 333 000 1111".into(),
            date: parse_date("2024-05-01").unwrap(),
            time: "20:00".into(),
            seats: 4,
            special_requests: Some("high chair".into()),
        }
    }

    fn fallback() -> Shift {
        Shift {
            time: "19:00".into(),
            enabled: true,
            max_reservations: 15,
        }
    }

    #[test]
    fn reservation_record_layout() {
        let record = encode_reservation(&draft(), Some("session-a"));
        assert_eq!(record[FULL_NAME], Field::from("Luca Bianchi"));
        assert_eq!(record[DATE], Field::from("2024-05-01"));
        assert_eq!(record[SEATS], Field::Int(4));
        assert_eq!(record_origin(&record), Some("session-a"));

        let bare = encode_reservation(
            &ReservationDraft {
                special_requests: None,
                ..draft()
            },
            None,
        );
        assert!(!bare.contains_key(SPECIAL_REQUESTS));
        assert!(!bare.contains_key(ORIGIN));
    }

    #[test]
    fn reservation_decodes_back() {
        let id = Ulid::new();
        let record = encode_reservation(&draft(), Some("s"));
        let r = decode_reservation(&id.to_string(), &record).unwrap();
        assert_eq!(r, Reservation::from_draft(id, draft()));
    }

    #[test]
    fn empty_special_requests_decode_as_none() {
        let mut record = encode_reservation(&draft(), None);
        record.insert(SPECIAL_REQUESTS.into(), Field::from(""));
        let r = decode_reservation(&Ulid::new().to_string(), &record).unwrap();
        assert_eq!(r.special_requests, None);
    }

    #[test]
    fn malformed_reservations_are_reported() {
        let key = Ulid::new().to_string();
        let good = encode_reservation(&draft(), None);

        assert_eq!(
            decode_reservation("not-an-id", &good).unwrap_err(),
            DecodeError::BadKey("not-an-id".into())
        );

        let mut missing = good.clone();
        missing.remove(PHONE);
        assert_eq!(decode_reservation(&key, &missing).unwrap_err(), DecodeError::Missing(PHONE));

        let mut wrong = good.clone();
        wrong.insert(SEATS.into(), Field::from("four"));
        assert_eq!(decode_reservation(&key, &wrong).unwrap_err(), DecodeError::WrongType(SEATS));

        let mut negative = good.clone();
        negative.insert(SEATS.into(), Field::Int(-1));
        assert!(matches!(
            decode_reservation(&key, &negative).unwrap_err(),
            DecodeError::BadValue(SEATS, _)
        ));

        let mut bad_date = good;
        bad_date.insert(DATE.into(), Field::from("May 1st"));
        assert!(matches!(
            decode_reservation(&key, &bad_date).unwrap_err(),
            DecodeError::BadValue(DATE, _)
        ));
    }

    #[test]
    fn out_of_range_seats_still_decode() {
        let mut record = encode_reservation(&draft(), None);
        record.insert(SEATS.into(), Field::Int(12));
        let r = decode_reservation(&Ulid::new().to_string(), &record).unwrap();
        assert_eq!(r.seats, 12);
    }

    #[test]
    fn shift_round_trip_and_fallbacks() {
        let shift = Shift {
            time: "21:00".into(),
            enabled: false,
            max_reservations: 30,
        };
        assert_eq!(decode_shift("21:00", &encode_shift(&shift), &fallback()).unwrap(), shift);

        let partial = encode_shift_patch(&ShiftPatch::enabled(false));
        let decoded = decode_shift("19:00", &partial, &fallback()).unwrap();
        assert!(!decoded.enabled);
        assert_eq!(decoded.max_reservations, 15);

        let mut zero = Record::new();
        zero.insert(MAX_RESERVATIONS.into(), Field::Int(0));
        assert!(decode_shift("19:00", &zero, &fallback()).is_err());

        let mut wrong = Record::new();
        wrong.insert(ENABLED.into(), Field::from("yes"));
        assert_eq!(
            decode_shift("19:00", &wrong, &fallback()).unwrap_err(),
            DecodeError::WrongType(ENABLED)
        );
    }

    #[test]
    fn patch_encodes_only_set_fields() {
        assert!(encode_shift_patch(&ShiftPatch::default()).is_empty());
        let record = encode_shift_patch(&ShiftPatch::capacity(12));
        assert_eq!(record.len(), 1);
        assert_eq!(record[MAX_RESERVATIONS], Field::Int(12));
    }
}
