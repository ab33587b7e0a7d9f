use crate::balance::{lock_week, CashBalancer, WeekBalance};
use crate::classifier::PatternClassifier;
use crate::config::ForecastConfig;
use crate::error::Result;
use crate::estimator::{matching_amounts, AmountEstimate, AmountEstimator};
use crate::generator::{horizon_window, merge_with_existing, ForecastGenerator, RegenerationScope};
use crate::ingestion::partition_by_group;
use crate::intervals::{latest_transaction_date, IntervalAnalyzer, IntervalStats};
use crate::overrides::{ForecastOverrides, PatternOverride};
use crate::reconciliation::{ReconciliationOutcome, Reconciler, WeekLockRegistry};
use crate::schema::{ForecastRecord, PatternAnalysis, PatternSource, Transaction, VendorGroup};
use crate::utils::{mean, week_start_for};
use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Everything produced for one vendor group in one forecast run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupForecast {
    pub analysis: PatternAnalysis,
    pub estimate: AmountEstimate,
    pub records: Vec<ForecastRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchForecast {
    /// Existing records outside the run, locked records, and the fresh forecast, ordered by key.
    pub records: Vec<ForecastRecord>,
    pub analyses: Vec<PatternAnalysis>,
    /// Groups with no generated records that need a hand-entered forecast.
    pub manual_review: Vec<String>,
    pub skipped_locked: usize,
    pub adjustments_applied: usize,
}

pub struct ForecastEngine {
    config: ForecastConfig,
    overrides: ForecastOverrides,
    week_locks: WeekLockRegistry,
}

impl ForecastEngine {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            overrides: ForecastOverrides::default(),
            week_locks: WeekLockRegistry::new(),
        })
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ForecastOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn overrides(&self) -> &ForecastOverrides {
        &self.overrides
    }

    pub fn week_locks(&self) -> &WeekLockRegistry {
        &self.week_locks
    }

    /// Classifies `group` over the lookback window ending at its latest transaction.
    pub fn analyze(&self, group: &VendorGroup, transactions: &[Transaction]) -> PatternAnalysis {
        let owned: Vec<Transaction> = transactions
            .iter()
            .filter(|t| group.owns(t))
            .cloned()
            .collect();
        let as_of = latest_transaction_date(&owned).unwrap_or_else(|| Utc::now().date_naive());
        self.analyze_as_of(group, &owned, as_of)
    }

    pub fn analyze_as_of(
        &self,
        group: &VendorGroup,
        transactions: &[Transaction],
        as_of: NaiveDate,
    ) -> PatternAnalysis {
        self.analyze_with_stats(group, transactions, as_of).0
    }

    /// The pattern-based amount for an analysed group, before any manual override.
    pub fn estimate(&self, analysis: &PatternAnalysis, stats: &IntervalStats) -> Result<AmountEstimate> {
        let estimator = AmountEstimator::new(&self.config.recency_weights)?;
        let matched = matching_amounts(
            &analysis.pattern,
            &stats.occurrences,
            self.config.cluster_tolerance_days,
        );
        Ok(estimator.estimate(&matched, stats.window))
    }

    /// The amount that applies on `date`: an active manual override, else the estimate.
    pub fn amount_on(
        &self,
        analysis: &PatternAnalysis,
        stats: &IntervalStats,
        date: NaiveDate,
    ) -> Result<AmountEstimate> {
        match self.overrides.amount_override_for(&analysis.vendor_group, date) {
            Some(manual) => Ok(AmountEstimate::manual(manual.amount)),
            None => self.estimate(analysis, stats),
        }
    }

    pub fn generate(&self, analysis: &PatternAnalysis, amount: f64, start: NaiveDate) -> Vec<ForecastRecord> {
        ForecastGenerator::new(self.config.horizon_weeks)
            .with_overrides(&self.overrides)
            .generate(analysis, amount, start)
    }

    /// Analyse, estimate and generate for one group.
    pub fn forecast_group(
        &self,
        group: &VendorGroup,
        transactions: &[Transaction],
        as_of: NaiveDate,
        start: NaiveDate,
    ) -> Result<GroupForecast> {
        let (analysis, stats) = self.analyze_with_stats(group, transactions, as_of);
        let estimate = self.estimate(&analysis, &stats)?;
        let records = self.generate(&analysis, estimate.amount, start);
        let estimate = match self.overrides.amount_override_for(&group.group_name, start) {
            Some(manual) => AmountEstimate::manual(manual.amount),
            None => estimate,
        };

        Ok(GroupForecast {
            analysis,
            estimate,
            records,
        })
    }

    /// Forecasts every active group of `client_id` in parallel and merges the result into
    /// `existing`, replacing unlocked records of those groups inside the horizon.
    ///
    /// A group that fails is logged and left out; the rest of the batch still completes.
    pub fn forecast_groups(
        &self,
        client_id: &str,
        groups: &[VendorGroup],
        transactions: &[Transaction],
        existing: &[ForecastRecord],
        as_of: NaiveDate,
        start: NaiveDate,
    ) -> Result<BatchForecast> {
        let client_groups: Vec<VendorGroup> = groups
            .iter()
            .filter(|g| g.client_id == client_id && g.active)
            .cloned()
            .collect();
        let partitioned = partition_by_group(&client_groups, transactions);

        info!(
            "Forecasting {} vendor group(s) for '{}' from {} ({} weeks)",
            client_groups.len(),
            client_id,
            start,
            self.config.horizon_weeks
        );

        let results: Vec<(String, Result<GroupForecast>)> = client_groups
            .par_iter()
            .map(|group| {
                let owned = partitioned
                    .by_group
                    .get(&group.group_name)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                (
                    group.group_name.clone(),
                    self.forecast_group(group, owned, as_of, start),
                )
            })
            .collect();

        let mut analyses = Vec::new();
        let mut fresh = Vec::new();
        let mut manual_review = Vec::new();
        let mut succeeded = BTreeSet::new();
        for (group_name, result) in results {
            match result {
                Ok(forecast) => {
                    if forecast.records.is_empty() {
                        manual_review.push(group_name.clone());
                    }
                    succeeded.insert(group_name);
                    analyses.push(forecast.analysis);
                    fresh.extend(forecast.records);
                }
                Err(e) => warn!("Skipping vendor group '{}': {}", group_name, e),
            }
        }

        let scope = RegenerationScope {
            client_id: client_id.to_string(),
            vendor_groups: succeeded,
            window: horizon_window(start, self.config.horizon_weeks),
        };
        let merged = merge_with_existing(existing, fresh, &scope, self.config.locked_date_policy)?;

        let mut records = merged.records;
        let adjustments_applied = self.overrides.apply_adjustments(client_id, &mut records);

        info!(
            "Forecast for '{}': {} new record(s), {} replaced, {} locked date(s) kept, {} group(s) need manual review",
            client_id,
            merged.inserted,
            merged.replaced,
            merged.skipped_locked,
            manual_review.len()
        );

        Ok(BatchForecast {
            records,
            analyses,
            manual_review,
            skipped_locked: merged.skipped_locked,
            adjustments_applied,
        })
    }

    /// Reconciles one week while holding its advisory lock.
    pub fn reconcile(
        &self,
        client_id: &str,
        week_start: NaiveDate,
        week_end: NaiveDate,
        actuals: &[Transaction],
        records: &mut [ForecastRecord],
    ) -> Result<ReconciliationOutcome> {
        let _guard = self.week_locks.try_acquire(client_id, week_start)?;
        Reconciler::new(&self.config).reconcile(client_id, week_start, week_end, actuals, records)
    }

    /// Reconciles one week, recomputes the client's balances from that week on and locks it.
    pub fn reconcile_week(
        &self,
        client_id: &str,
        week_start: NaiveDate,
        week_end: NaiveDate,
        actuals: &[Transaction],
        records: &mut [ForecastRecord],
        balances: &mut Vec<WeekBalance>,
    ) -> Result<ReconciliationOutcome> {
        let _guard = self.week_locks.try_acquire(client_id, week_start)?;
        let outcome =
            Reconciler::new(&self.config).reconcile(client_id, week_start, week_end, actuals, records)?;

        let balance_week = week_start_for(week_start, self.config.week_start);
        *balances = CashBalancer::new(&self.config).propagate_from(balances, records, balance_week);
        if !lock_week(balances, balance_week) {
            debug!(
                "No stored balance for '{}' week of {}; nothing to lock",
                client_id, balance_week
            );
        }

        Ok(outcome)
    }

    fn analyze_with_stats(
        &self,
        group: &VendorGroup,
        transactions: &[Transaction],
        as_of: NaiveDate,
    ) -> (PatternAnalysis, IntervalStats) {
        let owned: Vec<Transaction> = transactions
            .iter()
            .filter(|t| group.owns(t))
            .cloned()
            .collect();
        let stats = IntervalAnalyzer::new(self.config.lookback_days).analyze(&owned, as_of);

        let analysis = match self.overrides.pattern_override_for(&group.group_name) {
            Some(pattern_override) => self.manual_analysis(group, &stats, pattern_override),
            None => PatternClassifier::new(&self.config).classify(group, &stats),
        };

        info!(
            "Analysed '{}': {} on {} (confidence {:.2}, {} dates)",
            group.group_name,
            analysis.frequency(),
            analysis.timing_descriptor().unwrap_or_else(|| "-".to_string()),
            analysis.confidence,
            analysis.sample_size
        );

        (analysis, stats)
    }

    fn manual_analysis(
        &self,
        group: &VendorGroup,
        stats: &IntervalStats,
        pattern_override: &PatternOverride,
    ) -> PatternAnalysis {
        let daily_totals: Vec<f64> = stats.occurrences.iter().map(|o| o.amount).collect();
        let note = match &pattern_override.reason {
            Some(reason) => format!("Manual pattern override: {}", reason),
            None => "Manual pattern override".to_string(),
        };

        PatternAnalysis {
            client_id: group.client_id.clone(),
            vendor_group: group.group_name.clone(),
            pattern: pattern_override.pattern.clone(),
            confidence: 1.0,
            sample_size: stats.occurrence_count(),
            transaction_count: stats.transaction_count,
            skipped_invalid_dates: stats.skipped_invalid,
            date_range: stats.date_range(),
            median_gap_days: None,
            average_amount: mean(&daily_totals).unwrap_or(0.0),
            note,
            as_of: stats.window.end,
            lookback_days: self.config.lookback_days,
            source: PatternSource::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DayOfMonth, MonthlyDays, RecurrencePattern};
    use crate::overrides::AmountOverride;
    use chrono::{Datelike, Weekday};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn payroll() -> VendorGroup {
        VendorGroup::new("acme", "Payroll", false).with_vendors(["ADP"])
    }

    fn biweekly_history() -> Vec<Transaction> {
        ["2025-08-04", "2025-08-18", "2025-09-01", "2025-09-15"]
            .iter()
            .map(|date| Transaction::new("acme", "Payroll", *date, -1000.0))
            .collect()
    }

    #[test]
    fn test_analyze_uses_latest_date() {
        let engine = ForecastEngine::new(ForecastConfig::default()).unwrap();
        let analysis = engine.analyze(&payroll(), &biweekly_history());
        assert_eq!(analysis.as_of, d(2025, 9, 15));
        assert_eq!(
            analysis.pattern,
            RecurrencePattern::Biweekly {
                weekday: Weekday::Mon,
                anchor: d(2025, 9, 15)
            }
        );
        assert_eq!(analysis.source, PatternSource::Detected);
    }

    #[test]
    fn test_forecast_group_generates_biweekly_records() {
        let engine = ForecastEngine::new(ForecastConfig::default()).unwrap();
        let forecast = engine
            .forecast_group(&payroll(), &biweekly_history(), d(2025, 9, 15), d(2025, 9, 22))
            .unwrap();

        assert_eq!(forecast.records.len(), 6);
        assert_eq!(forecast.records[0].date, d(2025, 9, 29));
        assert!(forecast.records.iter().all(|r| r.date.weekday() == Weekday::Mon));
        assert!(forecast.records.iter().all(|r| r.forecasted_amount == -1000.0));
    }

    #[test]
    fn test_pattern_override_replaces_detection() {
        let overrides = ForecastOverrides {
            pattern_overrides: vec![PatternOverride {
                vendor_group: "Payroll".to_string(),
                pattern: RecurrencePattern::Monthly {
                    days: MonthlyDays::Single(DayOfMonth::Last),
                },
                reason: Some("moving to monthly payroll".to_string()),
            }],
            ..Default::default()
        };
        let engine = ForecastEngine::new(ForecastConfig::default())
            .unwrap()
            .with_overrides(overrides);

        let analysis = engine.analyze(&payroll(), &biweekly_history());
        assert_eq!(analysis.source, PatternSource::Manual);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.timing_descriptor(), Some("last-day".to_string()));
    }

    #[test]
    fn test_amount_on_prefers_override() {
        let overrides = ForecastOverrides {
            amount_overrides: vec![AmountOverride {
                vendor_group: "Payroll".to_string(),
                amount: -1500.0,
                effective_from: Some(d(2025, 10, 1)),
                expires_on: None,
                reason: None,
            }],
            ..Default::default()
        };
        let engine = ForecastEngine::new(ForecastConfig::default())
            .unwrap()
            .with_overrides(overrides);
        let (analysis, stats) = engine.analyze_with_stats(&payroll(), &biweekly_history(), d(2025, 9, 15));

        let before = engine.amount_on(&analysis, &stats, d(2025, 9, 30)).unwrap();
        assert_eq!(before.amount, -1000.0);
        let after = engine.amount_on(&analysis, &stats, d(2025, 10, 1)).unwrap();
        assert_eq!(after.amount, -1500.0);
        assert_eq!(after.method, crate::estimator::EstimateMethod::Manual);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ForecastConfig {
            recency_weights: vec![],
            ..Default::default()
        };
        assert!(ForecastEngine::new(config).is_err());
    }
}
