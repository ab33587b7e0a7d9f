use crate::config::ForecastConfig;
use crate::error::{ForecastError, Result};
use crate::ingestion::{group_actuals, GroupedActuals};
use crate::schema::{DateRange, ForecastRecord, Transaction};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

/// Actual amounts below this are treated as equal when comparing with a stored actual.
const AMOUNT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedActual {
    pub vendor_group: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub transaction_count: usize,
}

/// Counts reported after each weekly import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub transactions: usize,
    /// (vendor group, date) totals that found a forecast record.
    pub matched: usize,
    /// Records settled by this run.
    pub updated: usize,
    /// Matched records that were already locked and left as they were.
    pub already_locked: usize,
    pub unmatched: usize,
    /// Records with no activity settled at zero.
    pub missed_settled: usize,
    pub skipped_invalid: usize,
    pub skipped_outside_week: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceFlag {
    /// Activity with nothing forecast.
    Unexpected,
    /// Forecast with no activity.
    Missed,
    LargeVariance,
    OnTrack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupVariance {
    pub vendor_group: String,
    pub forecast_total: f64,
    pub actual_total: f64,
    pub variance: f64,
    /// Variance as a percentage of the absolute forecast; `None` when nothing was forecast.
    pub variance_pct: Option<f64>,
    pub flag: VarianceFlag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekVarianceSummary {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    /// Largest absolute variance first.
    pub groups: Vec<GroupVariance>,
    pub total_forecast: f64,
    pub total_actual: f64,
    pub total_variance: f64,
}

impl WeekVarianceSummary {
    pub fn flagged(&self) -> impl Iterator<Item = &GroupVariance> {
        self.groups.iter().filter(|g| g.flag != VarianceFlag::OnTrack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub client_id: String,
    pub week: DateRange,
    /// Snapshots of the records this run settled.
    pub updated_records: Vec<ForecastRecord>,
    pub unmatched_actuals: Vec<UnmatchedActual>,
    pub week_variance_summary: WeekVarianceSummary,
    pub stats: ImportStats,
}

pub struct Reconciler<'a> {
    config: &'a ForecastConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a ForecastConfig) -> Self {
        Self { config }
    }

    /// Settles `client_id`'s records in `[week_start, week_end]` against `actuals`.
    ///
    /// Actuals are summed per (vendor group, date). An unlocked record with activity gets that
    /// total as its actual and is locked; activity without a record is reported as unmatched.
    /// Locked records are never changed, so running the same week again yields the same records.
    pub fn reconcile(
        &self,
        client_id: &str,
        week_start: NaiveDate,
        week_end: NaiveDate,
        actuals: &[Transaction],
        records: &mut [ForecastRecord],
    ) -> Result<ReconciliationOutcome> {
        if week_start > week_end {
            return Err(ForecastError::InvalidWeek {
                start: week_start,
                end: week_end,
            });
        }

        let week = DateRange::new(week_start, week_end);
        let grouped = group_actuals(client_id, week, actuals);

        let mut stats = ImportStats {
            transactions: grouped.transaction_count,
            skipped_invalid: grouped.skipped_invalid,
            skipped_outside_week: grouped.skipped_outside_window,
            ..Default::default()
        };
        let mut matched_keys: BTreeSet<(String, NaiveDate)> = BTreeSet::new();
        let mut updated_records = Vec::new();

        for record in records
            .iter_mut()
            .filter(|r| r.client_id == client_id && week.contains(r.date))
        {
            match grouped.get(&record.vendor_group, record.date) {
                Some(total) => {
                    matched_keys.insert((record.vendor_group.clone(), record.date));
                    if record.is_locked {
                        if record
                            .actual_amount
                            .is_some_and(|stored| (stored - total.amount).abs() > AMOUNT_EPSILON)
                        {
                            warn!(
                                "'{}' on {} is locked at {:?}; ignoring new actual {:.2}",
                                record.vendor_group, record.date, record.actual_amount, total.amount
                            );
                        }
                        stats.already_locked += 1;
                        continue;
                    }
                    record.settle(total.amount);
                    stats.updated += 1;
                    updated_records.push(record.clone());
                }
                None if !record.is_locked && self.config.lock_missed_forecasts => {
                    debug!(
                        "No activity for '{}' on {}; settling at 0",
                        record.vendor_group, record.date
                    );
                    record.settle(0.0);
                    stats.missed_settled += 1;
                    updated_records.push(record.clone());
                }
                None => {}
            }
        }
        stats.matched = matched_keys.len();

        let unmatched_actuals: Vec<UnmatchedActual> = grouped
            .totals
            .iter()
            .filter(|(key, _)| !matched_keys.contains(*key))
            .map(|((vendor_group, date), total)| UnmatchedActual {
                vendor_group: vendor_group.clone(),
                date: *date,
                amount: total.amount,
                transaction_count: total.transaction_count,
            })
            .collect();
        stats.unmatched = unmatched_actuals.len();

        let week_variance_summary = self.variance_summary(client_id, week, &grouped, records);

        info!(
            "Reconciled '{}' week {}..{}: {} transactions, {} matched, {} updated, {} already locked, {} unmatched, {} missed settled, {} invalid",
            client_id,
            week_start,
            week_end,
            stats.transactions,
            stats.matched,
            stats.updated,
            stats.already_locked,
            stats.unmatched,
            stats.missed_settled,
            stats.skipped_invalid
        );

        Ok(ReconciliationOutcome {
            client_id: client_id.to_string(),
            week,
            updated_records,
            unmatched_actuals,
            week_variance_summary,
            stats,
        })
    }

    fn variance_summary(
        &self,
        client_id: &str,
        week: DateRange,
        grouped: &GroupedActuals,
        records: &[ForecastRecord],
    ) -> WeekVarianceSummary {
        // (forecast total, has records, actual total, has activity)
        let mut totals: BTreeMap<&str, (f64, bool, f64, bool)> = BTreeMap::new();

        for record in records
            .iter()
            .filter(|r| r.client_id == client_id && week.contains(r.date))
        {
            let entry = totals.entry(record.vendor_group.as_str()).or_default();
            entry.0 += record.forecasted_amount;
            entry.1 = true;
        }
        for ((vendor_group, _), total) in &grouped.totals {
            let entry = totals.entry(vendor_group.as_str()).or_default();
            entry.2 += total.amount;
            entry.3 = true;
        }

        let mut groups: Vec<GroupVariance> = totals
            .into_iter()
            .map(|(vendor_group, (forecast_total, has_records, actual_total, has_activity))| {
                let variance = actual_total - forecast_total;
                let variance_pct = (forecast_total.abs() > AMOUNT_EPSILON)
                    .then(|| variance / forecast_total.abs() * 100.0);

                let flag = if !has_records {
                    VarianceFlag::Unexpected
                } else if !has_activity {
                    VarianceFlag::Missed
                } else if variance_pct.map_or(variance.abs() > AMOUNT_EPSILON, |pct| {
                    pct.abs() > self.config.large_variance_pct
                }) {
                    VarianceFlag::LargeVariance
                } else {
                    VarianceFlag::OnTrack
                };

                GroupVariance {
                    vendor_group: vendor_group.to_string(),
                    forecast_total,
                    actual_total,
                    variance,
                    variance_pct,
                    flag,
                }
            })
            .collect();

        groups.sort_by(|a, b| {
            b.variance
                .abs()
                .total_cmp(&a.variance.abs())
                .then_with(|| a.vendor_group.cmp(&b.vendor_group))
        });

        let total_forecast: f64 = groups.iter().map(|g| g.forecast_total).sum();
        let total_actual: f64 = groups.iter().map(|g| g.actual_total).sum();

        WeekVarianceSummary {
            week_start: week.start,
            week_end: week.end,
            groups,
            total_forecast,
            total_actual,
            total_variance: total_actual - total_forecast,
        }
    }
}

pub fn reconcile_records(
    config: &ForecastConfig,
    client_id: &str,
    week_start: NaiveDate,
    week_end: NaiveDate,
    actuals: &[Transaction],
    records: &mut [ForecastRecord],
) -> Result<ReconciliationOutcome> {
    let reconciler = Reconciler::new(config);
    reconciler.reconcile(client_id, week_start, week_end, actuals, records)
}

/// Advisory locks held while a (client, week) is being reconciled.
#[derive(Debug, Default)]
pub struct WeekLockRegistry {
    held: Mutex<HashSet<(String, NaiveDate)>>,
}

impl WeekLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `(client_id, week_start)` or fails with `ReconciliationConflict`
    /// if another reconciliation holds it. The lock is released when the guard drops.
    pub fn try_acquire(&self, client_id: &str, week_start: NaiveDate) -> Result<WeekLockGuard<'_>> {
        let key = (client_id.to_string(), week_start);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return Err(ForecastError::ReconciliationConflict {
                client_id: client_id.to_string(),
                week_start,
            });
        }

        Ok(WeekLockGuard {
            registry: self,
            key,
        })
    }

    pub fn is_held(&self, client_id: &str, week_start: NaiveDate) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(&(client_id.to_string(), week_start))
    }
}

#[derive(Debug)]
pub struct WeekLockGuard<'a> {
    registry: &'a WeekLockRegistry,
    key: (String, NaiveDate),
}

impl Drop for WeekLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.registry.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForecastMethod, Frequency};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn record(group: &str, date: NaiveDate, amount: f64) -> ForecastRecord {
        ForecastRecord::new(
            "acme",
            group,
            date,
            amount,
            Frequency::Weekly,
            ForecastMethod::Pattern,
        )
    }

    fn actual(group: &str, date: &str, amount: f64) -> Transaction {
        Transaction::new("acme", group, date, amount)
    }

    #[test]
    fn test_matching_records_are_settled() {
        let config = ForecastConfig::default();
        let mut records = vec![
            record("Payroll", d(2025, 9, 1), -1000.0),
            record("Rent", d(2025, 9, 3), -2500.0),
            record("Payroll", d(2025, 9, 8), -1000.0),
        ];
        let actuals = vec![
            actual("Payroll", "2025-09-01", -600.0),
            actual("Payroll", "2025-09-01", -500.0),
            actual("Stripe", "2025-09-02", 4000.0),
        ];

        let outcome =
            reconcile_records(&config, "acme", d(2025, 9, 1), d(2025, 9, 7), &actuals, &mut records).unwrap();

        assert_eq!(records[0].actual_amount, Some(-1100.0));
        assert_eq!(records[0].variance, Some(-100.0));
        assert!(records[0].is_locked);
        assert!(!records[1].is_locked);
        assert!(!records[2].is_locked);

        assert_eq!(outcome.updated_records.len(), 1);
        assert_eq!(outcome.unmatched_actuals.len(), 1);
        assert_eq!(outcome.unmatched_actuals[0].vendor_group, "Stripe");
        assert_eq!(outcome.stats.transactions, 3);
        assert_eq!(outcome.stats.matched, 1);
        assert_eq!(outcome.stats.unmatched, 1);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let config = ForecastConfig::default();
        let mut records = vec![record("Payroll", d(2025, 9, 1), -1000.0)];
        let actuals = vec![actual("Payroll", "2025-09-01", -1000.0)];

        reconcile_records(&config, "acme", d(2025, 9, 1), d(2025, 9, 7), &actuals, &mut records).unwrap();
        let after_first = records.clone();
        let second =
            reconcile_records(&config, "acme", d(2025, 9, 1), d(2025, 9, 7), &actuals, &mut records).unwrap();

        assert_eq!(records, after_first);
        assert_eq!(records[0].variance, Some(0.0));
        assert!(second.updated_records.is_empty());
        assert_eq!(second.stats.already_locked, 1);
    }

    #[test]
    fn test_variance_flags() {
        let config = ForecastConfig::default();
        let mut records = vec![
            record("Payroll", d(2025, 9, 1), -1000.0),
            record("Rent", d(2025, 9, 3), -2500.0),
            record("Utilities", d(2025, 9, 4), -100.0),
        ];
        let actuals = vec![
            actual("Payroll", "2025-09-01", -1050.0),
            actual("Utilities", "2025-09-04", -200.0),
            actual("Stripe", "2025-09-02", 4000.0),
        ];

        let outcome =
            reconcile_records(&config, "acme", d(2025, 9, 1), d(2025, 9, 7), &actuals, &mut records).unwrap();
        let summary = &outcome.week_variance_summary;

        let flag_of = |group: &str| summary.groups.iter().find(|g| g.vendor_group == group).unwrap().flag;
        assert_eq!(flag_of("Payroll"), VarianceFlag::OnTrack);
        assert_eq!(flag_of("Rent"), VarianceFlag::Missed);
        assert_eq!(flag_of("Utilities"), VarianceFlag::LargeVariance);
        assert_eq!(flag_of("Stripe"), VarianceFlag::Unexpected);

        assert_eq!(summary.groups[0].vendor_group, "Stripe");
        assert_eq!(summary.groups[1].vendor_group, "Rent");
        assert_eq!(summary.flagged().count(), 3);
        assert!((summary.total_forecast - -3600.0).abs() < 1e-9);
        assert!((summary.total_actual - 2750.0).abs() < 1e-9);
        assert!((summary.total_variance - 6350.0).abs() < 1e-9);
    }

    #[test]
    fn test_missed_forecasts_settle_at_zero() {
        let config = ForecastConfig {
            lock_missed_forecasts: true,
            ..Default::default()
        };
        let mut records = vec![record("Rent", d(2025, 9, 3), -2500.0)];
        let outcome = reconcile_records(&config, "acme", d(2025, 9, 1), d(2025, 9, 7), &[], &mut records).unwrap();

        assert_eq!(outcome.stats.missed_settled, 1);
        assert_eq!(records[0].actual_amount, Some(0.0));
        assert_eq!(records[0].variance, Some(2500.0));
        assert!(records[0].is_locked);
    }

    #[test]
    fn test_inverted_week_is_rejected() {
        let config = ForecastConfig::default();
        let result = reconcile_records(&config, "acme", d(2025, 9, 7), d(2025, 9, 1), &[], &mut []);
        assert!(matches!(result, Err(ForecastError::InvalidWeek { .. })));
    }

    #[test]
    fn test_week_lock_conflict() {
        let registry = WeekLockRegistry::new();
        let guard = registry.try_acquire("acme", d(2025, 9, 1)).unwrap();
        assert!(registry.is_held("acme", d(2025, 9, 1)));

        let conflict = registry.try_acquire("acme", d(2025, 9, 1));
        assert!(matches!(conflict, Err(ForecastError::ReconciliationConflict { .. })));
        assert!(registry.try_acquire("acme", d(2025, 9, 8)).is_ok());
        assert!(registry.try_acquire("globex", d(2025, 9, 1)).is_ok());

        drop(guard);
        assert!(!registry.is_held("acme", d(2025, 9, 1)));
        assert!(registry.try_acquire("acme", d(2025, 9, 1)).is_ok());
    }
}
