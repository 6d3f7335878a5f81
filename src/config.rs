use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::engine::CapacityPolicy;
use crate::limits::{DEFAULT_MAX_RESERVATIONS, MAX_SHIFT_CAPACITY};
use crate::registry::{default_slots, parse_slot, ShiftDefaults};

/// Runtime settings, read from `SHIFTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub slots: Vec<String>,
    pub shift_defaults: ShiftDefaults,
    pub capacity_policy: CapacityPolicy,
    /// Also notify about reservations this session created itself.
    pub notify_local_writes: bool,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            slots: default_slots(),
            shift_defaults: ShiftDefaults::default(),
            capacity_policy: CapacityPolicy::Reject,
            notify_local_writes: false,
            compact_threshold: 1000,
        }
    }
}

impl FromStr for CapacityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(CapacityPolicy::Reject),
            "warn" => Ok(CapacityPolicy::Warn),
            other => Err(format!("unknown capacity policy: {other}")),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup("SHIFTBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let metrics_port = parsed(&lookup, "SHIFTBOOK_METRICS_PORT");
        let slots = lookup("SHIFTBOOK_SLOTS")
            .and_then(|raw| match parse_slot_list(&raw) {
                Ok(slots) => Some(slots),
                Err(e) => {
                    warn!("ignoring SHIFTBOOK_SLOTS: {e}");
                    None
                }
            })
            .unwrap_or(defaults.slots);
        let max_reservations = parsed::<u32>(&lookup, "SHIFTBOOK_DEFAULT_CAPACITY")
            .filter(|n| {
                let ok = (1..=MAX_SHIFT_CAPACITY).contains(n);
                if !ok {
                    warn!("ignoring SHIFTBOOK_DEFAULT_CAPACITY={n}: out of range");
                }
                ok
            })
            .unwrap_or(DEFAULT_MAX_RESERVATIONS);
        let enabled = parsed(&lookup, "SHIFTBOOK_SHIFTS_ENABLED")
            .unwrap_or(defaults.shift_defaults.enabled);
        let capacity_policy = parsed(&lookup, "SHIFTBOOK_CAPACITY_POLICY")
            .unwrap_or(defaults.capacity_policy);
        let notify_local_writes = parsed(&lookup, "SHIFTBOOK_NOTIFY_LOCAL_WRITES")
            .unwrap_or(defaults.notify_local_writes);
        let compact_threshold = parsed(&lookup, "SHIFTBOOK_COMPACT_THRESHOLD")
            .unwrap_or(defaults.compact_threshold);

        Self {
            data_dir,
            metrics_port,
            slots,
            shift_defaults: ShiftDefaults {
                enabled,
                max_reservations,
            },
            capacity_policy,
            notify_local_writes,
            compact_threshold,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("shiftbook.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid value");
            None
        }
    }
}

/// Parse `"12:00, 12:30,19:00"` into canonical `HH:MM` slots, rejecting duplicates.
fn parse_slot_list(raw: &str) -> Result<Vec<String>, String> {
    let mut slots: Vec<String> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let slot = parse_slot(part).ok_or_else(|| format!("bad slot {part:?}"))?;
        if slots.contains(&slot) {
            return Err(format!("duplicate slot {slot}"));
        }
        slots.push(slot);
    }
    if slots.is_empty() {
        return Err("no slots given".into());
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), Config::default());
    }

    #[test]
    fn reads_every_setting() {
        let c = config(&[
            ("SHIFTBOOK_DATA_DIR", "/var/lib/shiftbook"),
            ("SHIFTBOOK_METRICS_PORT", "9100"),
            ("SHIFTBOOK_SLOTS", "19:00, 20:30,9:15"),
            ("SHIFTBOOK_DEFAULT_CAPACITY", "24"),
            ("SHIFTBOOK_SHIFTS_ENABLED", "false"),
            ("SHIFTBOOK_CAPACITY_POLICY", "WARN"),
            ("SHIFTBOOK_NOTIFY_LOCAL_WRITES", "true"),
            ("SHIFTBOOK_COMPACT_THRESHOLD", "50"),
        ]);
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/shiftbook"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.slots, vec!["19:00", "20:30", "09:15"]);
        assert_eq!(
            c.shift_defaults,
            ShiftDefaults {
                enabled: false,
                max_reservations: 24
            }
        );
        assert_eq!(c.capacity_policy, CapacityPolicy::Warn);
        assert!(c.notify_local_writes);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/shiftbook/shiftbook.wal"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let c = config(&[
            ("SHIFTBOOK_METRICS_PORT", "ninety"),
            ("SHIFTBOOK_SLOTS", "19:00,25:00"),
            ("SHIFTBOOK_DEFAULT_CAPACITY", "0"),
            ("SHIFTBOOK_CAPACITY_POLICY", "maybe"),
            ("SHIFTBOOK_COMPACT_THRESHOLD", "-3"),
        ]);
        let d = Config::default();
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.slots, d.slots);
        assert_eq!(c.shift_defaults.max_reservations, DEFAULT_MAX_RESERVATIONS);
        assert_eq!(c.capacity_policy, CapacityPolicy::Reject);
        assert_eq!(c.compact_threshold, 1000);
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        assert!(parse_slot_list("19:00,19:00").is_err());
        assert!(parse_slot_list(" , ").is_err());
    }
}
