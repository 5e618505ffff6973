use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_areas, validate_template};
use super::mutations::record_rejection;
use super::recurrence::expand_dates;
use super::{AreaGuards, Engine, EngineError};

/// A date the rule produced but no booking was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDate {
    pub date: NaiveDate,
    pub reason: String,
}

/// Outcome of generating bookings from a rule.
#[derive(Debug, Clone)]
pub struct RecurringBatch {
    /// `None` when no date passed validation and nothing was stored.
    pub pattern: Option<RecurringPattern>,
    pub bookings: Vec<Booking>,
    pub skipped: Vec<SkippedDate>,
}

struct Plan {
    bookings: Vec<Booking>,
    skipped: Vec<SkippedDate>,
}

impl Engine {
    /// Validate every date and return the bookings that pass. Dates in
    /// `skip_date` are dropped silently.
    fn plan(
        &self,
        guards: &AreaGuards,
        pattern_id: Ulid,
        template: &BookingTemplate,
        dates: &[NaiveDate],
        exclude: &HashSet<Ulid>,
        skip_date: Option<NaiveDate>,
    ) -> Plan {
        let area_ids = template.area_ids();
        let now = self.now_ms();
        let mut plan = Plan {
            bookings: Vec::with_capacity(dates.len()),
            skipped: Vec::new(),
        };

        for &date in dates {
            if Some(date) == skip_date {
                continue;
            }
            match check_areas(guards, &area_ids, date, &template.range, exclude) {
                // Dates are distinct, so bookings in one batch never overlap.
                Ok(()) => {
                    plan.bookings.push(Booking::from_template(
                        Ulid::new(),
                        template,
                        date,
                        Some(pattern_id),
                        now,
                    ));
                }
                Err(e) => {
                    debug!("pattern {pattern_id}: skipping {date}: {e}");
                    record_rejection(&e);
                    metrics::counter!(crate::observability::RECURRING_DATES_SKIPPED_TOTAL).increment(1);
                    plan.skipped.push(SkippedDate {
                        date,
                        reason: e.to_string(),
                    });
                }
            }
        }
        plan
    }

    /// Expand `rule`, book every date that validates, and store the pattern
    /// with those bookings in one commit. Dates that fail are reported in
    /// `skipped`. The first booking becomes the pattern's primary booking.
    pub async fn create_recurring_bookings(
        &self,
        pattern_id: Ulid,
        template: BookingTemplate,
        rule: RecurrenceRule,
    ) -> Result<RecurringBatch, EngineError> {
        validate_template(&template)?;
        let dates = expand_dates(&rule)?;
        let _claim = self.claim_id(pattern_id, |id| self.patterns.contains_key(id))?;

        let mut guards = self.lock_areas(template.area_ids()).await?;
        let Plan { bookings, skipped } =
            self.plan(&guards, pattern_id, &template, &dates, &HashSet::new(), None);

        let Some(primary) = bookings.first() else {
            info!(
                "pattern {pattern_id}: no bookable dates out of {}",
                dates.len()
            );
            return Ok(RecurringBatch {
                pattern: None,
                bookings,
                skipped,
            });
        };

        let pattern = RecurringPattern {
            id: pattern_id,
            rule,
            primary_booking_id: primary.id,
            created_at: self.now_ms(),
        };
        let mut events = Vec::with_capacity(bookings.len() + 1);
        events.push(Event::PatternCreated {
            pattern: pattern.clone(),
        });
        events.extend(bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        self.commit(events, &mut guards).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        info!(
            "pattern {pattern_id}: created {} bookings, skipped {} dates",
            bookings.len(),
            skipped.len()
        );
        Ok(RecurringBatch {
            pattern: Some(pattern),
            bookings,
            skipped,
        })
    }

    /// Replace a pattern's rule and regenerate its bookings. The primary
    /// booking is kept as is and its date is not regenerated, so editing a
    /// pattern never duplicates it. All other bookings are replaced.
    pub async fn update_recurring_pattern(
        &self,
        pattern_id: Ulid,
        template: BookingTemplate,
        rule: RecurrenceRule,
    ) -> Result<RecurringBatch, EngineError> {
        validate_template(&template)?;
        let dates = expand_dates(&rule)?;

        let (current, old, mut guards) = self.lock_pattern(pattern_id, &template.area_ids()).await?;
        let primary = old
            .iter()
            .find(|b| b.id == current.primary_booking_id)
            .cloned();
        let replaced: HashSet<Ulid> = old
            .iter()
            .filter(|b| b.id != current.primary_booking_id)
            .map(|b| b.id)
            .collect();

        let Plan { bookings, skipped } = self.plan(
            &guards,
            pattern_id,
            &template,
            &dates,
            &replaced,
            primary.as_ref().map(|b| b.date),
        );

        let pattern = RecurringPattern {
            rule,
            ..current
        };
        let mut events: Vec<Event> = Vec::with_capacity(replaced.len() + bookings.len() + 1);
        events.extend(replaced.iter().map(|&id| Event::BookingDeleted { id }));
        events.extend(bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        events.push(Event::PatternUpdated {
            pattern: pattern.clone(),
        });
        self.commit(events, &mut guards).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        info!(
            "pattern {pattern_id}: replaced {} bookings with {}, skipped {} dates",
            replaced.len(),
            bookings.len(),
            skipped.len()
        );

        let mut all = Vec::with_capacity(bookings.len() + 1);
        all.extend(primary);
        all.extend(bookings);
        Ok(RecurringBatch {
            pattern: Some(pattern),
            bookings: all,
            skipped,
        })
    }

    /// Delete a pattern and every booking generated from it. Returns the number
    /// of bookings removed.
    pub async fn delete_recurring_pattern(&self, pattern_id: Ulid) -> Result<usize, EngineError> {
        let (_, old, mut guards) = self.lock_pattern(pattern_id, &[]).await?;
        let count = old.len();
        let mut events: Vec<Event> = old.iter().map(|b| Event::BookingDeleted { id: b.id }).collect();
        events.push(Event::PatternDeleted { id: pattern_id });
        self.commit(events, &mut guards).await?;
        info!("pattern {pattern_id}: deleted with {count} bookings");
        Ok(count)
    }

    /// Lock the areas of every booking in the pattern plus `extra`. Retries if
    /// the pattern's bookings changed while the locks were being taken.
    async fn lock_pattern(
        &self,
        pattern_id: Ulid,
        extra: &[Ulid],
    ) -> Result<(RecurringPattern, Vec<Booking>, AreaGuards), EngineError> {
        loop {
            let seen = self.pattern_bookings(pattern_id);
            let guards = self
                .lock_areas(
                    seen.iter()
                        .flat_map(|b| b.area_ids())
                        .chain(extra.iter().copied())
                        .collect::<Vec<_>>(),
                )
                .await?;
            let pattern = self
                .patterns
                .get(&pattern_id)
                .map(|p| p.value().clone())
                .ok_or(EngineError::NotFound(pattern_id))?;
            let current = self.pattern_bookings(pattern_id);
            if guards.holds_all(current.iter().flat_map(|b| b.area_ids())) {
                return Ok((pattern, current, guards));
            }
        }
    }

    /// Bookings linked to a pattern, ordered by date.
    pub(super) fn pattern_bookings(&self, pattern_id: Ulid) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().recurring_pattern_id == Some(pattern_id))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.date, b.range.start));
        out
    }
}
