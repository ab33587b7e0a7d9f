use crate::config::LockedDatePolicy;
use crate::error::{ForecastError, Result};
use crate::overrides::ForecastOverrides;
use crate::schema::{
    DateRange, ForecastMethod, ForecastRecord, PatternAnalysis, RecordKey, RecurrencePattern,
};
use chrono::{Days, NaiveDate};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Every date in `[start, end)` the pattern recurs on, ascending.
pub fn forecast_dates(pattern: &RecurrencePattern, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if *pattern == RecurrencePattern::Irregular {
        return Vec::new();
    }

    start
        .iter_days()
        .take_while(|date| *date < end)
        .filter(|date| pattern.matches(*date))
        .collect()
}

/// The forecast window: `horizon_weeks` whole weeks starting at `start`, end inclusive.
pub fn horizon_window(start: NaiveDate, horizon_weeks: u32) -> DateRange {
    let days = (horizon_weeks as u64 * 7).max(1) - 1;
    DateRange::new(start, start.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX))
}

pub struct ForecastGenerator<'a> {
    horizon_weeks: u32,
    overrides: Option<&'a ForecastOverrides>,
}

impl<'a> ForecastGenerator<'a> {
    pub fn new(horizon_weeks: u32) -> Self {
        Self {
            horizon_weeks,
            overrides: None,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: &'a ForecastOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Records for every date the analysed pattern recurs on inside the horizon.
    ///
    /// Irregular analyses produce nothing and are left for manual forecast entry.
    pub fn generate(&self, analysis: &PatternAnalysis, amount: f64, start: NaiveDate) -> Vec<ForecastRecord> {
        if analysis.needs_manual_forecast() {
            info!(
                "'{}' is irregular; no records generated, manual forecast needed",
                analysis.vendor_group
            );
            return Vec::new();
        }

        self.generate_for(
            &analysis.client_id,
            &analysis.vendor_group,
            &analysis.pattern,
            amount,
            start,
        )
    }

    /// Dates covered by an active amount override carry the override amount and `method = manual`.
    pub fn generate_for(
        &self,
        client_id: &str,
        vendor_group: &str,
        pattern: &RecurrencePattern,
        amount: f64,
        start: NaiveDate,
    ) -> Vec<ForecastRecord> {
        let window = horizon_window(start, self.horizon_weeks);
        let end = window.end.succ_opt().unwrap_or(NaiveDate::MAX);
        let pattern_type = pattern.frequency();

        let records: Vec<ForecastRecord> = forecast_dates(pattern, window.start, end)
            .into_iter()
            .map(|date| {
                let manual = self
                    .overrides
                    .and_then(|o| o.amount_override_for(vendor_group, date));
                let (amount, method) = match manual {
                    Some(o) => (o.amount, ForecastMethod::Manual),
                    None => (amount, ForecastMethod::Pattern),
                };
                ForecastRecord::new(client_id, vendor_group, date, amount, pattern_type, method)
            })
            .collect();

        debug!(
            "Generated {} {} record(s) for '{}' from {} to {}",
            records.len(),
            pattern_type,
            vendor_group,
            window.start,
            window.end
        );

        records
    }
}

/// The slice of stored records a regeneration run replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerationScope {
    pub client_id: String,
    pub vendor_groups: BTreeSet<String>,
    pub window: DateRange,
}

impl RegenerationScope {
    pub fn covers(&self, record: &ForecastRecord) -> bool {
        record.client_id == self.client_id
            && self.vendor_groups.contains(&record.vendor_group)
            && self.window.contains(record.date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Ordered by (client, vendor group, date).
    pub records: Vec<ForecastRecord>,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped_locked: usize,
}

/// Replaces the unlocked records inside `scope` with `fresh` ones.
///
/// Locked records are carried over unchanged. A fresh record landing on a locked date is dropped
/// under [`LockedDatePolicy::Skip`] and fails the whole merge under [`LockedDatePolicy::Refuse`].
pub fn merge_with_existing(
    existing: &[ForecastRecord],
    fresh: Vec<ForecastRecord>,
    scope: &RegenerationScope,
    policy: LockedDatePolicy,
) -> Result<MergeOutcome> {
    let mut merged: BTreeMap<RecordKey, ForecastRecord> = BTreeMap::new();
    let mut replaced = 0;

    for record in existing {
        if !record.is_locked && scope.covers(record) {
            replaced += 1;
            continue;
        }
        merged.insert(record.key(), record.clone());
    }

    let mut inserted = 0;
    let mut skipped_locked = 0;
    for record in fresh {
        let key = record.key();
        if merged.get(&key).is_some_and(|r| r.is_locked) {
            match policy {
                LockedDatePolicy::Skip => {
                    debug!(
                        "Keeping locked record for '{}' on {}",
                        record.vendor_group, record.date
                    );
                    skipped_locked += 1;
                    continue;
                }
                LockedDatePolicy::Refuse => {
                    warn!(
                        "Refusing regeneration: '{}' on {} is locked",
                        record.vendor_group, record.date
                    );
                    return Err(ForecastError::AmbiguousOverlap {
                        vendor_group: record.vendor_group,
                        date: record.date,
                    });
                }
            }
        }
        merged.insert(key, record);
        inserted += 1;
    }

    Ok(MergeOutcome {
        records: merged.into_values().collect(),
        inserted,
        replaced,
        skipped_locked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DayOfMonth, Frequency, MonthlyDays, PatternSource};
    use crate::overrides::AmountOverride;
    use chrono::{Datelike, Weekday};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn analysis(pattern: RecurrencePattern) -> PatternAnalysis {
        PatternAnalysis {
            client_id: "acme".to_string(),
            vendor_group: "Payroll".to_string(),
            pattern,
            confidence: 1.0,
            sample_size: 4,
            transaction_count: 4,
            skipped_invalid_dates: 0,
            date_range: None,
            median_gap_days: Some(14.0),
            average_amount: -1000.0,
            note: String::new(),
            as_of: d(2025, 9, 15),
            lookback_days: 90,
            source: PatternSource::Detected,
        }
    }

    fn scope(window: DateRange) -> RegenerationScope {
        RegenerationScope {
            client_id: "acme".to_string(),
            vendor_groups: BTreeSet::from(["Payroll".to_string()]),
            window,
        }
    }

    #[test]
    fn test_weekly_horizon() {
        let pattern = RecurrencePattern::Weekly {
            weekday: Weekday::Mon,
        };
        let records = ForecastGenerator::new(13).generate(&analysis(pattern), -50.0, d(2025, 9, 22));
        assert_eq!(records.len(), 13);
        assert!(records.iter().all(|r| r.date.weekday() == Weekday::Mon));
        assert_eq!(records.last().unwrap().date, d(2025, 12, 15));
        assert!(records.iter().all(|r| r.method == ForecastMethod::Pattern));
    }

    #[test]
    fn test_biweekly_keeps_parity() {
        let pattern = RecurrencePattern::Biweekly {
            weekday: Weekday::Mon,
            anchor: d(2025, 9, 15),
        };
        let dates = forecast_dates(&pattern, d(2025, 9, 16), d(2025, 10, 28));
        assert_eq!(dates, vec![d(2025, 9, 29), d(2025, 10, 13), d(2025, 10, 27)]);
    }

    #[test]
    fn test_weekday_daily_skips_weekends() {
        let pattern = RecurrencePattern::Daily {
            weekdays_only: true,
        };
        let dates = forecast_dates(&pattern, d(2025, 9, 22), d(2025, 9, 29));
        assert_eq!(dates.len(), 5);
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let pattern = RecurrencePattern::Monthly {
            days: MonthlyDays::Single(DayOfMonth::Day(31)),
        };
        let dates = forecast_dates(&pattern, d(2025, 1, 1), d(2025, 5, 1));
        assert_eq!(
            dates,
            vec![d(2025, 1, 31), d(2025, 2, 28), d(2025, 3, 31), d(2025, 4, 30)]
        );
    }

    #[test]
    fn test_quarterly_and_annual() {
        let quarterly = RecurrencePattern::Quarterly {
            month: 1,
            day: DayOfMonth::Day(20),
        };
        let dates = forecast_dates(&quarterly, d(2025, 1, 1), d(2026, 1, 1));
        assert_eq!(
            dates,
            vec![d(2025, 1, 20), d(2025, 4, 20), d(2025, 7, 20), d(2025, 10, 20)]
        );

        let annual = RecurrencePattern::Annual {
            month: 3,
            day: DayOfMonth::Day(1),
        };
        assert_eq!(forecast_dates(&annual, d(2025, 1, 1), d(2026, 1, 1)), vec![d(2025, 3, 1)]);
    }

    #[test]
    fn test_irregular_generates_nothing() {
        let records =
            ForecastGenerator::new(13).generate(&analysis(RecurrencePattern::Irregular), -10.0, d(2025, 9, 22));
        assert!(records.is_empty());
    }

    #[test]
    fn test_amount_override_marks_manual() {
        let overrides = ForecastOverrides {
            amount_overrides: vec![AmountOverride {
                vendor_group: "Payroll".to_string(),
                amount: -1200.0,
                effective_from: Some(d(2025, 9, 23)),
                expires_on: None,
                reason: Some("raise".to_string()),
            }],
            ..Default::default()
        };
        let pattern = RecurrencePattern::Weekly {
            weekday: Weekday::Mon,
        };
        let records = ForecastGenerator::new(4)
            .with_overrides(&overrides)
            .generate(&analysis(pattern), -1000.0, d(2025, 9, 22));

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].method, ForecastMethod::Pattern);
        assert_eq!(records[0].forecasted_amount, -1000.0);
        assert!(records[1..]
            .iter()
            .all(|r| r.method == ForecastMethod::Manual && r.forecasted_amount == -1200.0));
    }

    #[test]
    fn test_merge_keeps_locked_records() {
        let window = horizon_window(d(2025, 9, 1), 4);
        let mut locked = ForecastRecord::new(
            "acme",
            "Payroll",
            d(2025, 9, 1),
            -1000.0,
            Frequency::Weekly,
            ForecastMethod::Pattern,
        );
        locked.settle(-990.0);
        let stale = ForecastRecord::new(
            "acme",
            "Payroll",
            d(2025, 9, 8),
            -1000.0,
            Frequency::Weekly,
            ForecastMethod::Pattern,
        );

        let pattern = RecurrencePattern::Weekly {
            weekday: Weekday::Mon,
        };
        let fresh = ForecastGenerator::new(4).generate(&analysis(pattern), -1100.0, d(2025, 9, 1));

        let outcome = merge_with_existing(
            &[locked.clone(), stale],
            fresh.clone(),
            &scope(window),
            LockedDatePolicy::Skip,
        )
        .unwrap();

        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.records[0], locked);
        assert_eq!(outcome.skipped_locked, 1);
        assert_eq!(outcome.replaced, 1);
        assert!(outcome.records[1..].iter().all(|r| r.forecasted_amount == -1100.0));

        let refused = merge_with_existing(&[locked], fresh, &scope(window), LockedDatePolicy::Refuse);
        assert!(matches!(refused, Err(ForecastError::AmbiguousOverlap { .. })));
    }

    #[test]
    fn test_horizon_window() {
        let window = horizon_window(d(2025, 9, 1), 13);
        assert_eq!(window.end, d(2025, 11, 30));
        assert_eq!(window.span_days(), 90);
    }
}
