use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_area, validate_range};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_areas(&self) -> Vec<Area> {
        let states: Vec<_> = self.areas.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for rs in states {
            out.push(rs.read().await.area.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_area(&self, id: Ulid) -> Option<Area> {
        let rs = self.get_area_state(&id)?;
        let area = rs.read().await.area.clone();
        Some(area)
    }

    /// Weekly records first (Monday to Sunday), then date records by date.
    pub async fn get_availabilities(&self, area_id: Ulid) -> Result<Vec<Availability>, EngineError> {
        let rs = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let mut out = rs.read().await.availabilities.clone();
        out.sort_by_key(|a| match a.window {
            AvailabilityWindow::Weekly(w) => (0, w.num_days_from_monday() as i64),
            AvailabilityWindow::OnDate(d) => (1, d.num_days_from_ce() as i64),
        });
        Ok(out)
    }

    /// Bookings touching `area_id` between `from` and `to` inclusive, ordered
    /// by date and start time.
    pub async fn get_bookings(
        &self,
        area_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        if to < from {
            return Err(EngineError::InvalidDateRange { start: from, end: to });
        }
        if (to - from).num_days() > MAX_QUERY_SPAN_DAYS {
            return Err(EngineError::LimitExceeded("query span too wide"));
        }
        let rs = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let ids: Vec<Ulid> = {
            let guard = rs.read().await;
            guard
                .slots
                .range(from..=to)
                .flat_map(|(_, day)| day.iter().map(|s| s.booking_id))
                .collect()
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| self.bookings.get(&id).map(|b| b.value().clone()))
            .collect())
    }

    /// Area an availability record belongs to.
    pub fn availability_area(&self, id: Ulid) -> Option<Ulid> {
        self.availability_to_area.get(&id).map(|e| *e.value())
    }

    pub fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.bookings.get(&id).map(|b| b.value().clone())
    }

    pub fn get_pattern(&self, id: Ulid) -> Option<RecurringPattern> {
        self.patterns.get(&id).map(|p| p.value().clone())
    }

    pub fn get_pattern_bookings(&self, id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.patterns.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(self.pattern_bookings(id))
    }

    /// Total price: each area's custom price if set, its base price otherwise.
    pub async fn booking_price(&self, id: Ulid) -> Result<Cents, EngineError> {
        let booking = self.get_booking(id).ok_or(EngineError::NotFound(id))?;
        let mut total: Cents = 0;
        for ba in &booking.areas {
            let price = match ba.custom_price {
                Some(price) => price,
                None => {
                    self.get_area(ba.area_id)
                        .await
                        .ok_or(EngineError::NotFound(ba.area_id))?
                        .base_price
                }
            };
            total = total
                .checked_add(price)
                .ok_or(EngineError::LimitExceeded("booking price overflows"))?;
        }
        Ok(total)
    }

    /// Would a booking of `area_ids` on `date` for `range` be accepted right
    /// now? Reports the first failing area in the given order. Advisory only:
    /// the answer can change before a booking is actually made.
    pub async fn check_booking(
        &self,
        area_ids: &[Ulid],
        date: NaiveDate,
        range: &TimeRange,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate_range(range)?;
        if area_ids.is_empty() {
            return Err(EngineError::EmptyAreas);
        }
        let exclude: HashSet<Ulid> = exclude.into_iter().collect();
        // One read lock at a time, released before the next.
        for &id in area_ids {
            let rs = self.get_area_state(&id).ok_or(EngineError::NotFound(id))?;
            let guard = rs.read().await;
            check_area(&guard, date, range, &exclude)?;
        }
        Ok(())
    }

    pub async fn is_bookable(
        &self,
        area_ids: &[Ulid],
        date: NaiveDate,
        range: &TimeRange,
        exclude: Option<Ulid>,
    ) -> bool {
        self.check_booking(area_ids, date, range, exclude).await.is_ok()
    }
}
