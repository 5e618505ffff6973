//! Hard caps on what a single request may ask of the engine.

pub const MAX_AREAS: usize = 256;
pub const MAX_AVAILABILITIES_PER_AREA: usize = 4_096;
pub const MAX_AREAS_PER_BOOKING: usize = 16;
pub const MAX_NAME_LEN: usize = 256;

/// Widest `start_date..=end_date` span a recurrence rule may cover.
pub const MAX_RECURRENCE_SPAN_DAYS: i64 = 3_660;
pub const MAX_RECURRENCE_INTERVAL: u32 = 365;
pub const MAX_EXCLUDED_DATES: usize = 1_024;

/// Widest date span a booking listing may cover.
pub const MAX_QUERY_SPAN_DAYS: i64 = 3_660;
