use crate::error::{ForecastError, Result};
use chrono::Weekday;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockedDatePolicy {
    #[default]
    #[schemars(description = "Regeneration leaves locked dates untouched and drops the colliding new record.")]
    Skip,

    #[schemars(description = "Regeneration fails if any new record lands on a locked date.")]
    Refuse,
}

/// Tunables for analysis, generation and reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ForecastConfig {
    #[schemars(description = "Days of history (ending at the analysis date) considered when classifying a vendor group.")]
    pub lookback_days: u32,

    #[schemars(description = "Weeks of forecast records generated from the start date.")]
    pub horizon_weeks: u32,

    #[schemars(
        description = "Weights for monthly averages, most recent complete month first. The default 2:1:1 doubles the latest month."
    )]
    pub recency_weights: Vec<f64>,

    #[schemars(description = "Minimum distinct transaction dates required before a pattern can be anything but irregular.")]
    pub min_occurrences: usize,

    #[schemars(
        description = "A history spanning this many median intervals (or the whole lookback window, if shorter) counts as complete."
    )]
    pub completeness_cycles: u32,

    #[schemars(description = "Share of occurrences each day-of-month cluster needs for a two-day monthly timing.")]
    pub bimodal_cluster_share: f64,

    #[schemars(description = "Days apart two day-of-month values can be and still count as the same cluster.")]
    pub cluster_tolerance_days: u32,

    #[schemars(description = "Absolute variance percentage above which a group is flagged in the weekly report.")]
    pub large_variance_pct: f64,

    pub locked_date_policy: LockedDatePolicy,

    #[schemars(
        description = "Settle unlocked records with no actual activity at 0 when their week is reconciled."
    )]
    pub lock_missed_forecasts: bool,

    #[schemars(with = "String")]
    pub week_start: Weekday,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            horizon_weeks: 13,
            recency_weights: vec![2.0, 1.0, 1.0],
            min_occurrences: 3,
            completeness_cycles: 3,
            bimodal_cluster_share: 0.30,
            cluster_tolerance_days: 2,
            large_variance_pct: 20.0,
            locked_date_policy: LockedDatePolicy::Skip,
            lock_missed_forecasts: false,
            week_start: Weekday::Mon,
        }
    }
}

impl ForecastConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ForecastConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lookback_days == 0 {
            return Err(ForecastError::InvalidConfig(
                "lookback_days must be at least 1".to_string(),
            ));
        }
        if self.horizon_weeks == 0 {
            return Err(ForecastError::InvalidConfig(
                "horizon_weeks must be at least 1".to_string(),
            ));
        }
        if self.min_occurrences < 2 {
            return Err(ForecastError::InvalidConfig(format!(
                "min_occurrences must be at least 2 (got {})",
                self.min_occurrences
            )));
        }
        if self.completeness_cycles == 0 {
            return Err(ForecastError::InvalidConfig(
                "completeness_cycles must be at least 1".to_string(),
            ));
        }
        if !(self.bimodal_cluster_share > 0.0 && self.bimodal_cluster_share <= 0.5) {
            return Err(ForecastError::InvalidConfig(format!(
                "bimodal_cluster_share must be in (0, 0.5] (got {})",
                self.bimodal_cluster_share
            )));
        }
        if self.large_variance_pct < 0.0 {
            return Err(ForecastError::InvalidConfig(format!(
                "large_variance_pct must be non-negative (got {})",
                self.large_variance_pct
            )));
        }
        validate_recency_weights(&self.recency_weights)
    }

    pub fn json_schema() -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(schemars::schema_for!(ForecastConfig))
    }
}

pub fn validate_recency_weights(weights: &[f64]) -> Result<()> {
    if weights.is_empty() {
        return Err(ForecastError::InvalidRecencyWeights(
            "at least one weight is required".to_string(),
        ));
    }

    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ForecastError::InvalidRecencyWeights(
            "all weights must be finite and non-negative".to_string(),
        ));
    }

    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(ForecastError::InvalidRecencyWeights(format!(
            "weights must sum to a positive value (got {})",
            sum
        )));
    }

    Ok(())
}
