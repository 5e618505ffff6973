use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AvailabilityWindow, TimeRange};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    AreaInactive(Ulid),
    AreaUnavailable {
        area_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    },
    Conflict(Ulid),
    DuplicateAvailability {
        area_id: Ulid,
        window: AvailabilityWindow,
        existing: Ulid,
    },
    InvalidTimeRange(TimeRange),
    InvalidInterval(u32),
    InvalidDateRange {
        start: NaiveDate,
        end: NaiveDate,
    },
    EmptyAreas,
    DuplicateArea(Ulid),
    HasBookings(Ulid),
    PrimaryBooking(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short label for metrics and skip reports.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::AreaInactive(_) => "area_inactive",
            EngineError::AreaUnavailable { .. } => "area_unavailable",
            EngineError::Conflict(_) => "conflict",
            EngineError::DuplicateAvailability { .. } => "duplicate_availability",
            EngineError::InvalidTimeRange(_) => "invalid_time_range",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::InvalidDateRange { .. } => "invalid_date_range",
            EngineError::EmptyAreas => "empty_areas",
            EngineError::DuplicateArea(_) => "duplicate_area",
            EngineError::HasBookings(_) => "has_bookings",
            EngineError::PrimaryBooking(_) => "primary_booking",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AreaInactive(id) => write!(f, "area {id} is not active"),
            EngineError::AreaUnavailable {
                area_id,
                date,
                range,
            } => write!(f, "area {area_id} is not available on {date} {range}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::DuplicateAvailability {
                area_id,
                window,
                existing,
            } => {
                let on = match window {
                    AvailabilityWindow::Weekly(day) => format!("every {day}"),
                    AvailabilityWindow::OnDate(date) => date.to_string(),
                };
                write!(
                    f,
                    "area {area_id} already has availability {existing} for {on}"
                )
            }
            EngineError::InvalidTimeRange(range) => {
                write!(f, "invalid time range {range}: start must be before end")
            }
            EngineError::InvalidInterval(n) => {
                write!(f, "invalid interval {n}: must be at least 1")
            }
            EngineError::InvalidDateRange { start, end } => {
                write!(f, "invalid date range: {end} is before {start}")
            }
            EngineError::EmptyAreas => write!(f, "booking must include at least one area"),
            EngineError::DuplicateArea(id) => write!(f, "area {id} listed twice"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete area {id}: it has bookings")
            }
            EngineError::PrimaryBooking(id) => write!(
                f,
                "booking {id} anchors a recurring pattern; delete the pattern instead"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
