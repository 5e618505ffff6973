use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::is_area_available;
use super::{AreaGuards, EngineError};

/// First booking on this area and date overlapping `range`, skipping ids in
/// `exclude`.
pub fn find_conflict(
    rs: &AreaState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: &HashSet<Ulid>,
) -> Option<Ulid> {
    let day = rs.slots_on(date);
    // Slots at or past right_bound start at or after range.end and can't overlap.
    let right_bound = day.partition_point(|s| s.range.start < range.end);
    day[..right_bound]
        .iter()
        .filter(|s| !exclude.contains(&s.booking_id))
        .find(|s| s.range.overlaps(range))
        .map(|s| s.booking_id)
}

/// Does `range` overlap an existing booking? `exclude` lets an edit ignore the
/// booking being edited.
pub fn has_conflict(rs: &AreaState, date: NaiveDate, range: &TimeRange, exclude: Option<Ulid>) -> bool {
    let exclude: HashSet<Ulid> = exclude.into_iter().collect();
    find_conflict(rs, date, range, &exclude).is_some()
}

/// Active, open, and free. Reports the first reason it isn't.
pub(crate) fn check_area(
    rs: &AreaState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: &HashSet<Ulid>,
) -> Result<(), EngineError> {
    if !rs.area.active {
        return Err(EngineError::AreaInactive(rs.area.id));
    }
    if !is_area_available(rs, date, range) {
        return Err(EngineError::AreaUnavailable {
            area_id: rs.area.id,
            date,
            range: *range,
        });
    }
    if let Some(other) = find_conflict(rs, date, range, exclude) {
        return Err(EngineError::Conflict(other));
    }
    Ok(())
}

/// Check every area in the caller's order, stopping at the first failure.
pub(super) fn check_areas(
    guards: &AreaGuards,
    area_ids: &[Ulid],
    date: NaiveDate,
    range: &TimeRange,
    exclude: &HashSet<Ulid>,
) -> Result<(), EngineError> {
    for id in area_ids {
        let rs = guards.get(id).ok_or(EngineError::NotFound(*id))?;
        check_area(rs, date, range, exclude)?;
    }
    Ok(())
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.is_valid() {
        Ok(())
    } else {
        Err(EngineError::InvalidTimeRange(*range))
    }
}

pub(crate) fn validate_template(template: &BookingTemplate) -> Result<(), EngineError> {
    use crate::limits::MAX_AREAS_PER_BOOKING;

    validate_range(&template.range)?;
    if template.areas.is_empty() {
        return Err(EngineError::EmptyAreas);
    }
    if template.areas.len() > MAX_AREAS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many areas on booking"));
    }
    let mut seen = HashSet::with_capacity(template.areas.len());
    for a in &template.areas {
        if !seen.insert(a.area_id) {
            return Err(EngineError::DuplicateArea(a.area_id));
        }
    }
    Ok(())
}
