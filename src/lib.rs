//! # Vendor Cash-Flow Forecaster
//!
//! A library for turning a client's transaction history into a rolling weekly cash-flow
//! forecast, and for reconciling that forecast against what actually happened.
//!
//! ## Core Concepts
//!
//! - **Vendor Groups**: User-defined sets of vendors forecast as one unit (payroll, rent, card payouts)
//! - **Patterns**: Each group is classified as daily, weekly, biweekly, monthly, quarterly, annual
//!   or irregular, with the timing it recurs on and a confidence score
//! - **Forecast Records**: One dated amount per group per occurrence over a 13-week horizon
//! - **Reconciliation**: Weekly actuals settle matching records, which are then locked for good
//! - **Cash Balance**: Week-by-week balances recomputed from an opening balance, actuals where
//!   locked and forecasts elsewhere
//!
//! ## Example
//!
//! ```rust,ignore
//! use vendor_cashflow_forecaster::*;
//! use chrono::NaiveDate;
//!
//! let payroll = VendorGroup::new("acme", "Payroll", false).with_vendors(["ADP"]);
//! let history = vec![
//!     Transaction::new("acme", "Payroll", "2025-08-04", -12_000.0),
//!     Transaction::new("acme", "Payroll", "2025-08-18", -12_000.0),
//!     Transaction::new("acme", "Payroll", "2025-09-01", -12_000.0),
//!     Transaction::new("acme", "Payroll", "2025-09-15", -12_000.0),
//! ];
//!
//! let analysis = analyze(&payroll, &history, 90)?;
//! assert_eq!(analysis.timing_descriptor().as_deref(), Some("Monday"));
//!
//! let start = NaiveDate::from_ymd_opt(2025, 9, 22).unwrap();
//! let mut records = generate(&payroll, &analysis.pattern, -12_000.0, 13, start);
//!
//! let week_start = NaiveDate::from_ymd_opt(2025, 9, 29).unwrap();
//! let week_end = NaiveDate::from_ymd_opt(2025, 10, 5).unwrap();
//! let actuals = vec![Transaction::new("acme", "Payroll", "2025-09-29", -12_400.0)];
//! let outcome = reconcile("acme", week_start, week_end, &actuals, &mut records)?;
//! assert_eq!(outcome.updated_records[0].variance, Some(-400.0));
//! ```

pub mod balance;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod generator;
pub mod ingestion;
pub mod intervals;
pub mod overrides;
pub mod reconciliation;
pub mod schema;
pub mod utils;

pub use balance::{compute_balances, lock_week, propagate_balances, CashBalancer, WeekBalance};
pub use classifier::PatternClassifier;
pub use config::{ForecastConfig, LockedDatePolicy};
pub use engine::{BatchForecast, ForecastEngine, GroupForecast};
pub use error::{ForecastError, Result};
pub use estimator::{AmountEstimate, AmountEstimator, AmountTrend, EstimateMethod};
pub use generator::{forecast_dates, merge_with_existing, ForecastGenerator, MergeOutcome, RegenerationScope};
pub use ingestion::{group_actuals, partition_by_group, GroupedActuals, PartitionedTransactions};
pub use intervals::{DailyAmount, IntervalAnalyzer, IntervalStats};
pub use overrides::*;
pub use reconciliation::{
    reconcile_records, GroupVariance, ImportStats, ReconciliationOutcome, Reconciler, UnmatchedActual,
    VarianceFlag, WeekLockGuard, WeekLockRegistry, WeekVarianceSummary,
};
pub use schema::*;

use chrono::NaiveDate;
use log::debug;

/// Classifies one vendor group over the last `lookback_days` of its history.
///
/// The window ends at the group's latest transaction. Malformed dates are skipped; a group with
/// too little history comes back irregular with confidence 0 rather than as an error.
pub fn analyze(group: &VendorGroup, transactions: &[Transaction], lookback_days: u32) -> Result<PatternAnalysis> {
    let config = ForecastConfig {
        lookback_days,
        ..Default::default()
    };
    let engine = ForecastEngine::new(config)?;
    Ok(engine.analyze(group, transactions))
}

/// Records for every date `pattern` recurs on in the `horizon_weeks` weeks from `start_date`.
pub fn generate(
    group: &VendorGroup,
    pattern: &RecurrencePattern,
    amount: f64,
    horizon_weeks: u32,
    start_date: NaiveDate,
) -> Vec<ForecastRecord> {
    debug!(
        "Generating {} for '{}' over {} weeks from {}",
        pattern.frequency(),
        group.group_name,
        horizon_weeks,
        start_date
    );
    ForecastGenerator::new(horizon_weeks).generate_for(
        &group.client_id,
        &group.group_name,
        pattern,
        amount,
        start_date,
    )
}

/// Settles `records` for one client week against its actual transactions, with default settings.
pub fn reconcile(
    client_id: &str,
    week_start: NaiveDate,
    week_end: NaiveDate,
    actuals: &[Transaction],
    records: &mut [ForecastRecord],
) -> Result<ReconciliationOutcome> {
    reconcile_records(
        &ForecastConfig::default(),
        client_id,
        week_start,
        week_end,
        actuals,
        records,
    )
}
