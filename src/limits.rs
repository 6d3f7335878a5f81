// Hard limits enforced before any store I/O.

pub const MIN_SEATS: u32 = 1;
pub const MAX_SEATS: u32 = 8;

/// Capacity of a shift that was never explicitly configured.
pub const DEFAULT_MAX_RESERVATIONS: u32 = 15;
pub const MAX_SHIFT_CAPACITY: u32 = 10_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_REQUESTS_LEN: usize = 2_000;

/// Broadcast buffer per watched collection.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;
/// Pending appends queued for the group-commit writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
