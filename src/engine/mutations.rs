use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_areas, validate_range, validate_template};
use super::{AreaGuards, Engine, EngineError};

pub(super) fn record_rejection(err: &EngineError) {
    metrics::counter!(
        crate::observability::VALIDATION_REJECTIONS_TOTAL,
        "reason" => err.reason()
    )
    .increment(1);
}

impl Engine {
    // ── Areas ────────────────────────────────────────────────

    pub async fn create_area(&self, area: Area) -> Result<(), EngineError> {
        if area.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("area name too long"));
        }
        if self.areas.len() >= MAX_AREAS {
            return Err(EngineError::LimitExceeded("too many areas"));
        }
        let _claim = self.claim_id(area.id, |id| self.areas.contains_key(id))?;
        let mut guards = self.lock_areas([]).await?;
        self.commit(vec![Event::AreaCreated { area }], &mut guards).await
    }

    /// Replace name, base price and active flag. Existing bookings are kept
    /// even when the area is deactivated.
    pub async fn update_area(&self, area: Area) -> Result<(), EngineError> {
        if area.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("area name too long"));
        }
        let mut guards = self.lock_areas([area.id]).await?;
        self.commit(vec![Event::AreaUpdated { area }], &mut guards).await
    }

    pub async fn delete_area(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guards = self.lock_areas([id]).await?;
        let rs = guards.get(&id).ok_or(EngineError::NotFound(id))?;
        if rs.has_bookings() {
            return Err(EngineError::HasBookings(id));
        }
        self.commit(vec![Event::AreaDeleted { id }], &mut guards).await
    }

    // ── Availability windows ─────────────────────────────────

    pub async fn add_availability(&self, availability: Availability) -> Result<(), EngineError> {
        validate_range(&availability.range)?;
        let _claim = self.claim_id(availability.id, |id| self.availability_to_area.contains_key(id))?;
        let area_id = availability.area_id;
        let mut guards = self.lock_areas([area_id]).await?;
        let rs = guards.get(&area_id).ok_or(EngineError::NotFound(area_id))?;
        if rs.availabilities.len() >= MAX_AVAILABILITIES_PER_AREA {
            return Err(EngineError::LimitExceeded("too many availability windows on area"));
        }
        if let Some(existing) = rs.window_taken(&availability.window, None) {
            return Err(EngineError::DuplicateAvailability {
                area_id,
                window: availability.window,
                existing,
            });
        }
        self.commit(vec![Event::AvailabilityAdded { availability }], &mut guards)
            .await
    }

    /// Replace a window in place. It may move to a different day or area as long
    /// as the target slot is free.
    pub async fn update_availability(&self, availability: Availability) -> Result<(), EngineError> {
        validate_range(&availability.range)?;
        let prev_area = self
            .availability_to_area
            .get(&availability.id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(availability.id))?;
        let area_id = availability.area_id;
        let mut guards = self.lock_areas([prev_area, area_id]).await?;
        let rs = guards.get(&area_id).ok_or(EngineError::NotFound(area_id))?;
        if let Some(existing) = rs.window_taken(&availability.window, Some(availability.id)) {
            return Err(EngineError::DuplicateAvailability {
                area_id,
                window: availability.window,
                existing,
            });
        }
        self.commit(vec![Event::AvailabilityUpdated { availability }], &mut guards)
            .await
    }

    pub async fn remove_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let area_id = self
            .availability_to_area
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_areas([area_id]).await?;
        self.commit(vec![Event::AvailabilityRemoved { id, area_id }], &mut guards)
            .await?;
        Ok(area_id)
    }

    // ── Single bookings ──────────────────────────────────────

    pub async fn create_booking(
        &self,
        id: Ulid,
        template: BookingTemplate,
        date: NaiveDate,
    ) -> Result<Booking, EngineError> {
        validate_template(&template)?;
        let _claim = self.claim_id(id, |id| self.bookings.contains_key(id))?;
        let area_ids = template.area_ids();
        let mut guards = self.lock_areas(area_ids.iter().copied()).await?;
        check_areas(&guards, &area_ids, date, &template.range, &HashSet::new())
            .inspect_err(record_rejection)?;

        let booking = Booking::from_template(id, &template, date, None, self.now_ms());
        self.commit(
            vec![Event::BookingCreated {
                booking: booking.clone(),
            }],
            &mut guards,
        )
        .await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Re-validate and replace a booking. The booking itself is ignored by the
    /// conflict check, so saving an unchanged time range succeeds. The pattern
    /// link and creation stamp are kept.
    pub async fn update_booking(
        &self,
        id: Ulid,
        template: BookingTemplate,
        date: NaiveDate,
    ) -> Result<Booking, EngineError> {
        validate_template(&template)?;
        let area_ids = template.area_ids();
        let (current, mut guards) = self.lock_booking(id, &area_ids).await?;

        let exclude: HashSet<Ulid> = [id].into_iter().collect();
        check_areas(&guards, &area_ids, date, &template.range, &exclude)
            .inspect_err(record_rejection)?;

        let booking = Booking::from_template(
            id,
            &template,
            date,
            current.recurring_pattern_id,
            current.created_at,
        );
        self.commit(
            vec![Event::BookingUpdated {
                booking: booking.clone(),
            }],
            &mut guards,
        )
        .await?;
        Ok(booking)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (current, mut guards) = self.lock_booking(id, &[]).await?;
        if let Some(pid) = current.recurring_pattern_id
            && self
                .patterns
                .get(&pid)
                .is_some_and(|p| p.primary_booking_id == id)
        {
            return Err(EngineError::PrimaryBooking(id));
        }
        self.commit(vec![Event::BookingDeleted { id }], &mut guards)
            .await
    }

    /// Lock a booking's current areas plus `extra`. Retries if the booking
    /// moved to other areas while the locks were being taken.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        extra: &[Ulid],
    ) -> Result<(Booking, AreaGuards), EngineError> {
        loop {
            let seen = self
                .bookings
                .get(&id)
                .map(|b| b.value().clone())
                .ok_or(EngineError::NotFound(id))?;
            let guards = self
                .lock_areas(seen.area_ids().chain(extra.iter().copied()))
                .await?;
            let current = self
                .bookings
                .get(&id)
                .map(|b| b.value().clone())
                .ok_or(EngineError::NotFound(id))?;
            if guards.holds_all(current.area_ids()) {
                return Ok((current, guards));
            }
        }
    }
}
