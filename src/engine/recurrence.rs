use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Expand a rule into its booking dates, ascending and without repeats.
///
/// Every date in `start_date..=end_date` is tested against the frequency:
/// - daily: whole days since start divisible by `interval`;
/// - weekly: whole weeks since start divisible by `interval`, and the weekday
///   is listed in `days_of_week` (an empty list matches nothing);
/// - monthly: whole months since start divisible by `interval`, on the start's
///   day of month. Months lacking that day are skipped, not rolled over.
///
/// Excluded dates are removed last.
pub fn expand_dates(rule: &RecurrenceRule) -> Result<Vec<NaiveDate>, EngineError> {
    validate_rule(rule)?;

    let excluded: HashSet<NaiveDate> = rule.excluded_dates.iter().copied().collect();
    let start = rule.start_date;
    let interval = i64::from(rule.interval);

    let dates = start
        .iter_days()
        .take_while(|date| *date <= rule.end_date)
        .filter(|date| match rule.frequency {
            Frequency::Daily => (*date - start).num_days() % interval == 0,
            Frequency::Weekly => {
                ((*date - start).num_days() / 7) % interval == 0
                    && rule.days_of_week.contains(&date.weekday())
            }
            Frequency::Monthly => {
                date.day() == start.day() && months_between(start, *date) % interval == 0
            }
        })
        .filter(|date| !excluded.contains(date))
        .collect();

    Ok(dates)
}

pub(crate) fn validate_rule(rule: &RecurrenceRule) -> Result<(), EngineError> {
    if rule.interval == 0 {
        return Err(EngineError::InvalidInterval(0));
    }
    if rule.interval > MAX_RECURRENCE_INTERVAL {
        return Err(EngineError::LimitExceeded("recurrence interval too large"));
    }
    if rule.end_date < rule.start_date {
        return Err(EngineError::InvalidDateRange {
            start: rule.start_date,
            end: rule.end_date,
        });
    }
    if (rule.end_date - rule.start_date).num_days() > MAX_RECURRENCE_SPAN_DAYS {
        return Err(EngineError::LimitExceeded("recurrence span too wide"));
    }
    if rule.excluded_dates.len() > MAX_EXCLUDED_DATES {
        return Err(EngineError::LimitExceeded("too many excluded dates"));
    }
    Ok(())
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    let from = i64::from(from.year()) * 12 + i64::from(from.month0());
    let to = i64::from(to.year()) * 12 + i64::from(to.month0());
    to - from
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn daily_week_yields_seven_dates() {
        let dates = expand_dates(&RecurrenceRule::daily(d(2024, 4, 1), d(2024, 4, 7))).unwrap();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates.first(), Some(&d(2024, 4, 1)));
        assert_eq!(dates.last(), Some(&d(2024, 4, 7)));
    }

    #[test]
    fn daily_interval_three() {
        let rule = RecurrenceRule::daily(d(2024, 4, 1), d(2024, 4, 10)).every(3);
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![d(2024, 4, 1), d(2024, 4, 4), d(2024, 4, 7), d(2024, 4, 10)]
        );
    }

    #[test]
    fn single_day_range() {
        let rule = RecurrenceRule::daily(d(2024, 4, 1), d(2024, 4, 1));
        assert_eq!(expand_dates(&rule).unwrap(), vec![d(2024, 4, 1)]);
    }

    #[test]
    fn weekly_mon_wed_fri_over_april() {
        let rule = RecurrenceRule::weekly(
            d(2024, 4, 1),
            d(2024, 4, 30),
            vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
        );
        let dates = expand_dates(&rule).unwrap();
        assert_eq!(dates.len(), 13);
        for date in &dates {
            assert!(
                [1, 3, 5].contains(&date.weekday().number_from_monday()),
                "{date} is a {}",
                date.weekday()
            );
        }
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn weekly_without_days_yields_nothing() {
        let rule = RecurrenceRule::weekly(d(2024, 4, 1), d(2024, 4, 30), vec![]);
        assert!(expand_dates(&rule).unwrap().is_empty());
    }

    #[test]
    fn biweekly_skips_odd_weeks() {
        let rule = RecurrenceRule::weekly(d(2024, 4, 1), d(2024, 4, 30), vec![Weekday::Mon]).every(2);
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![d(2024, 4, 1), d(2024, 4, 15), d(2024, 4, 29)]
        );
    }

    #[test]
    fn weekly_weeks_count_from_start_not_from_monday() {
        // Start on a Wednesday: days 0..=6 are week 0, so the following
        // Monday (day 5) is still week 0 and is kept with interval 2.
        let rule = RecurrenceRule::weekly(d(2024, 4, 3), d(2024, 4, 22), vec![Weekday::Mon]).every(2);
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![d(2024, 4, 8), d(2024, 4, 22)]
        );
    }

    #[test]
    fn monthly_keeps_day_of_month() {
        let rule = RecurrenceRule::monthly(d(2024, 1, 15), d(2024, 6, 30));
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![
                d(2024, 1, 15),
                d(2024, 2, 15),
                d(2024, 3, 15),
                d(2024, 4, 15),
                d(2024, 5, 15),
                d(2024, 6, 15),
            ]
        );
    }

    #[test]
    fn monthly_from_the_31st_skips_short_months() {
        let rule = RecurrenceRule::monthly(d(2024, 1, 31), d(2024, 12, 31));
        let dates = expand_dates(&rule).unwrap();
        let months: Vec<u32> = dates.iter().map(|d| d.month()).collect();
        assert_eq!(months, vec![1, 3, 5, 7, 8, 10, 12]);
        assert!(dates.iter().all(|d| d.day() == 31));
    }

    #[test]
    fn bimonthly_from_the_31st() {
        let rule = RecurrenceRule::monthly(d(2024, 1, 31), d(2024, 12, 31)).every(2);
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![d(2024, 1, 31), d(2024, 3, 31), d(2024, 5, 31), d(2024, 7, 31)]
        );
    }

    #[test]
    fn monthly_across_year_boundary() {
        let rule = RecurrenceRule::monthly(d(2024, 11, 10), d(2025, 2, 10));
        assert_eq!(
            expand_dates(&rule).unwrap(),
            vec![d(2024, 11, 10), d(2024, 12, 10), d(2025, 1, 10), d(2025, 2, 10)]
        );
    }

    #[test]
    fn excluded_dates_are_removed() {
        let rule = RecurrenceRule::daily(d(2024, 4, 1), d(2024, 4, 7))
            .excluding(vec![d(2024, 4, 3), d(2024, 4, 4)]);
        let dates = expand_dates(&rule).unwrap();
        assert_eq!(dates.len(), 5);
        assert!(!dates.contains(&d(2024, 4, 3)));
        assert!(!dates.contains(&d(2024, 4, 4)));
    }

    #[test]
    fn excluded_dates_outside_the_rule_are_harmless() {
        let rule = RecurrenceRule::weekly(d(2024, 4, 1), d(2024, 4, 14), vec![Weekday::Mon])
            .excluding(vec![d(2024, 4, 2), d(2024, 5, 6), d(2024, 4, 8)]);
        assert_eq!(expand_dates(&rule).unwrap(), vec![d(2024, 4, 1)]);
    }

    #[test]
    fn zero_interval_rejected() {
        let rule = RecurrenceRule::daily(d(2024, 4, 1), d(2024, 4, 7)).every(0);
        assert!(matches!(expand_dates(&rule), Err(EngineError::InvalidInterval(0))));
    }

    #[test]
    fn reversed_range_rejected() {
        let rule = RecurrenceRule::daily(d(2024, 4, 7), d(2024, 4, 1));
        assert!(matches!(expand_dates(&rule), Err(EngineError::InvalidDateRange { .. })));
    }

    #[test]
    fn span_limit_enforced() {
        let rule = RecurrenceRule::daily(d(2000, 1, 1), d(2030, 1, 1));
        assert!(matches!(expand_dates(&rule), Err(EngineError::LimitExceeded(_))));
    }
}
