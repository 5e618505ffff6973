use chrono::NaiveDate;

use crate::model::*;

/// Is the area open for `range` on `date`?
///
/// True when the date's own record or the weekly record for its weekday is
/// marked available and covers the whole range. Records marked unavailable
/// never match. Only the time-of-day bounds are compared.
pub fn is_area_available(rs: &AreaState, date: NaiveDate, range: &TimeRange) -> bool {
    rs.windows_for(date)
        .any(|window| window.is_available && range.within(&window.range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sheet() -> AreaState {
        AreaState::new(Area {
            id: Ulid::new(),
            name: "Sheet B".into(),
            base_price: 9_000,
            active: true,
        })
    }

    fn window(rs: &mut AreaState, w: AvailabilityWindow, open: NaiveTime, close: NaiveTime, is_available: bool) {
        let area_id = rs.area.id;
        rs.upsert_availability(Availability {
            id: Ulid::new(),
            area_id,
            window: w,
            range: TimeRange::new(open, close),
            is_available,
        });
    }

    // 2024-04-01 is a Monday.

    #[test]
    fn no_records_means_closed() {
        let rs = sheet();
        assert!(!is_area_available(&rs, d(2024, 4, 1), &TimeRange::new(t(9, 0), t(10, 0))));
    }

    #[test]
    fn weekly_window_matches_weekday() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(22, 0), true);

        let range = TimeRange::new(t(18, 0), t(20, 0));
        assert!(is_area_available(&rs, d(2024, 4, 1), &range));
        assert!(is_area_available(&rs, d(2024, 4, 8), &range));
        assert!(!is_area_available(&rs, d(2024, 4, 2), &range)); // Tuesday
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(22, 0), true);
        let monday = d(2024, 4, 1);

        assert!(is_area_available(&rs, monday, &TimeRange::new(t(8, 0), t(22, 0))));
        assert!(!is_area_available(&rs, monday, &TimeRange::new(t(7, 30), t(9, 0))));
        assert!(!is_area_available(&rs, monday, &TimeRange::new(t(21, 0), t(22, 30))));
    }

    #[test]
    fn unavailable_record_closes_the_day() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(22, 0), false);
        assert!(!is_area_available(&rs, d(2024, 4, 1), &TimeRange::new(t(9, 0), t(10, 0))));
    }

    #[test]
    fn unavailable_date_record_leaves_weekly_window_open() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(22, 0), true);
        window(&mut rs, AvailabilityWindow::OnDate(d(2024, 4, 1)), t(8, 0), t(22, 0), false);

        let range = TimeRange::new(t(9, 0), t(10, 0));
        assert!(is_area_available(&rs, d(2024, 4, 1), &range));
        assert!(is_area_available(&rs, d(2024, 4, 8), &range));
    }

    #[test]
    fn narrow_date_record_does_not_hide_weekly_window() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(22, 0), true);
        window(&mut rs, AvailabilityWindow::OnDate(d(2024, 4, 1)), t(12, 0), t(14, 0), true);

        assert!(is_area_available(&rs, d(2024, 4, 1), &TimeRange::new(t(18, 0), t(20, 0))));
        assert!(is_area_available(&rs, d(2024, 4, 1), &TimeRange::new(t(12, 30), t(13, 30))));
    }

    #[test]
    fn range_must_fit_inside_one_window() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Mon), t(8, 0), t(12, 0), true);
        window(&mut rs, AvailabilityWindow::OnDate(d(2024, 4, 1)), t(12, 0), t(16, 0), true);

        // Each half fits a window; the whole range fits neither.
        assert!(!is_area_available(&rs, d(2024, 4, 1), &TimeRange::new(t(11, 0), t(13, 0))));
    }

    #[test]
    fn date_record_opens_extra_hours() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::Weekly(Weekday::Sat), t(10, 0), t(16, 0), true);
        // Bonspiel weekend runs late.
        window(&mut rs, AvailabilityWindow::OnDate(d(2024, 4, 6)), t(7, 0), t(23, 30), true);

        let late = TimeRange::new(t(20, 0), t(23, 0));
        assert!(is_area_available(&rs, d(2024, 4, 6), &late));
        assert!(!is_area_available(&rs, d(2024, 4, 13), &late));
    }

    #[test]
    fn date_record_on_a_day_without_weekly_window() {
        let mut rs = sheet();
        window(&mut rs, AvailabilityWindow::OnDate(d(2024, 4, 2)), t(12, 0), t(14, 0), true);
        assert!(is_area_available(&rs, d(2024, 4, 2), &TimeRange::new(t(12, 0), t(13, 0))));
        assert!(!is_area_available(&rs, d(2024, 4, 9), &TimeRange::new(t(12, 0), t(13, 0))));
    }
}
