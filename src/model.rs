use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit stamps only.
pub type Ms = i64;

/// Integer cents.
pub type Cents = i64;

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Touching ranges do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Inclusive on both ends: a booking may start exactly at opening and end
    /// exactly at closing.
    pub fn within(&self, window: &TimeRange) -> bool {
        window.start <= self.start && self.end <= window.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// A bookable zone of the facility, e.g. an ice sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: Ulid,
    pub name: String,
    pub base_price: Cents,
    pub active: bool,
}

/// Which days an availability record applies to. A record is either weekly or
/// pinned to a single date, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityWindow {
    Weekly(Weekday),
    OnDate(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub area_id: Ulid,
    pub window: AvailabilityWindow,
    pub range: TimeRange,
    pub is_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    League,
    Practice,
    PrivateRental,
    Bonspiel,
    LearnToCurl,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::League => "league",
            EventType::Practice => "practice",
            EventType::PrivateRental => "private_rental",
            EventType::Bonspiel => "bonspiel",
            EventType::LearnToCurl => "learn_to_curl",
            EventType::Other => "other",
        }
    }

    /// Calendar color for this kind of event.
    pub fn color(&self) -> &'static str {
        match self {
            EventType::League => "#2563eb",
            EventType::Practice => "#16a34a",
            EventType::PrivateRental => "#9333ea",
            EventType::Bonspiel => "#dc2626",
            EventType::LearnToCurl => "#f59e0b",
            EventType::Other => "#6b7280",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "league" => Ok(EventType::League),
            "practice" => Ok(EventType::Practice),
            "private_rental" | "rental" => Ok(EventType::PrivateRental),
            "bonspiel" => Ok(EventType::Bonspiel),
            "learn_to_curl" => Ok(EventType::LearnToCurl),
            "other" => Ok(EventType::Other),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Waived,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Waived => "waived",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "refunded" => Ok(PaymentStatus::Refunded),
            "waived" => Ok(PaymentStatus::Waived),
            _ => Err(format!("unknown payment status: {s}")),
        }
    }
}

/// Join row between a booking and one of its areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingArea {
    pub area_id: Ulid,
    /// Overrides the area's base price for this booking.
    pub custom_price: Option<Cents>,
}

impl BookingArea {
    pub fn new(area_id: Ulid) -> Self {
        Self {
            area_id,
            custom_price: None,
        }
    }
}

/// The user-supplied part of a booking: everything except the date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingTemplate {
    pub user_id: Ulid,
    pub range: TimeRange,
    pub event_type: EventType,
    pub payment_status: PaymentStatus,
    pub areas: Vec<BookingArea>,
}

impl BookingTemplate {
    pub fn area_ids(&self) -> Vec<Ulid> {
        self.areas.iter().map(|a| a.area_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub event_type: EventType,
    pub payment_status: PaymentStatus,
    pub areas: Vec<BookingArea>,
    pub recurring_pattern_id: Option<Ulid>,
    pub created_at: Ms,
}

impl Booking {
    pub fn from_template(
        id: Ulid,
        template: &BookingTemplate,
        date: NaiveDate,
        recurring_pattern_id: Option<Ulid>,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            user_id: template.user_id,
            date,
            range: template.range,
            event_type: template.event_type,
            payment_status: template.payment_status,
            areas: template.areas.clone(),
            recurring_pattern_id,
            created_at,
        }
    }

    pub fn area_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.areas.iter().map(|a| a.area_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => Err(format!("unknown frequency: {s}")),
        }
    }
}

/// Generative rule behind a recurring pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Only consulted for weekly rules.
    pub days_of_week: Vec<Weekday>,
    pub excluded_dates: Vec<NaiveDate>,
}

impl RecurrenceRule {
    pub fn daily(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            frequency: Frequency::Daily,
            interval: 1,
            start_date,
            end_date,
            days_of_week: Vec::new(),
            excluded_dates: Vec::new(),
        }
    }

    pub fn weekly(start_date: NaiveDate, end_date: NaiveDate, days_of_week: Vec<Weekday>) -> Self {
        Self {
            frequency: Frequency::Weekly,
            interval: 1,
            start_date,
            end_date,
            days_of_week,
            excluded_dates: Vec::new(),
        }
    }

    pub fn monthly(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            frequency: Frequency::Monthly,
            interval: 1,
            start_date,
            end_date,
            days_of_week: Vec::new(),
            excluded_dates: Vec::new(),
        }
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn excluding(mut self, dates: Vec<NaiveDate>) -> Self {
        self.excluded_dates = dates;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub id: Ulid,
    pub rule: RecurrenceRule,
    /// First booking created from the pattern; survives pattern edits.
    pub primary_booking_id: Ulid,
    pub created_at: Ms,
}

/// A booking's footprint on one area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedSlot {
    pub booking_id: Ulid,
    pub range: TimeRange,
}

#[derive(Debug, Clone)]
pub struct AreaState {
    pub area: Area,
    pub availabilities: Vec<Availability>,
    /// Slots per date, each day's list sorted by `range.start`.
    pub slots: BTreeMap<NaiveDate, Vec<BookedSlot>>,
}

impl AreaState {
    pub fn new(area: Area) -> Self {
        Self {
            area,
            availabilities: Vec::new(),
            slots: BTreeMap::new(),
        }
    }

    /// Records that apply to `date`: its date-specific record and the weekly
    /// record for its weekday, whichever exist.
    pub fn windows_for(&self, date: NaiveDate) -> impl Iterator<Item = &Availability> {
        let weekday = date.weekday();
        self.availabilities.iter().filter(move |a| match a.window {
            AvailabilityWindow::OnDate(d) => d == date,
            AvailabilityWindow::Weekly(w) => w == weekday,
        })
    }

    /// Returns the id of another record already occupying `window`.
    pub fn window_taken(&self, window: &AvailabilityWindow, except: Option<Ulid>) -> Option<Ulid> {
        self.availabilities
            .iter()
            .find(|a| a.window == *window && Some(a.id) != except)
            .map(|a| a.id)
    }

    pub fn upsert_availability(&mut self, availability: Availability) {
        match self.availabilities.iter_mut().find(|a| a.id == availability.id) {
            Some(existing) => *existing = availability,
            None => self.availabilities.push(availability),
        }
    }

    pub fn remove_availability(&mut self, id: Ulid) -> Option<Availability> {
        let pos = self.availabilities.iter().position(|a| a.id == id)?;
        Some(self.availabilities.remove(pos))
    }

    pub fn slots_on(&self, date: NaiveDate) -> &[BookedSlot] {
        self.slots.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a slot keeping the day's list sorted by start time.
    pub fn insert_slot(&mut self, date: NaiveDate, slot: BookedSlot) {
        let day = self.slots.entry(date).or_default();
        let pos = day.partition_point(|s| s.range.start <= slot.range.start);
        day.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, date: NaiveDate, booking_id: Ulid) -> Option<BookedSlot> {
        let day = self.slots.get_mut(&date)?;
        let pos = day.iter().position(|s| s.booking_id == booking_id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.slots.remove(&date);
        }
        Some(removed)
    }

    pub fn has_bookings(&self) -> bool {
        !self.slots.is_empty()
    }
}

/// WAL record. A commit is a `Vec<Event>` written as one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AreaCreated { area: Area },
    AreaUpdated { area: Area },
    AreaDeleted { id: Ulid },
    AvailabilityAdded { availability: Availability },
    AvailabilityUpdated { availability: Availability },
    AvailabilityRemoved { id: Ulid, area_id: Ulid },
    BookingCreated { booking: Booking },
    BookingUpdated { booking: Booking },
    BookingDeleted { id: Ulid },
    PatternCreated { pattern: RecurringPattern },
    PatternUpdated { pattern: RecurringPattern },
    PatternDeleted { id: Ulid },
}
