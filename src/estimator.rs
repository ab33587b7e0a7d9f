use crate::config::validate_recency_weights;
use crate::error::Result;
use crate::intervals::DailyAmount;
use crate::schema::{DateRange, DayOfMonth, MonthlyDays, RecurrencePattern};
use crate::utils::{is_weekend, last_day_of_month, mean, months_in_period};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative change between first and last monthly average treated as a trend.
const TREND_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    RecencyWeighted,
    SimpleMean,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmountEstimate {
    pub amount: f64,
    pub method: EstimateMethod,
    /// Complete months that fed the weighted average (0 for the other methods).
    pub months_used: usize,
    pub sample_size: usize,
}

impl AmountEstimate {
    pub fn manual(amount: f64) -> Self {
        Self {
            amount,
            method: EstimateMethod::Manual,
            months_used: 0,
            sample_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountTrend {
    Rising,
    Falling,
    Stable,
}

pub struct AmountEstimator<'a> {
    weights: &'a [f64],
}

impl<'a> AmountEstimator<'a> {
    /// `weights` apply to complete months, most recent first.
    pub fn new(weights: &'a [f64]) -> Result<Self> {
        validate_recency_weights(weights)?;
        Ok(Self { weights })
    }

    /// Weighted average of the most recent calendar months lying wholly inside `window`.
    ///
    /// Those months are consecutive. When fewer of them than weights are fully covered, or one of
    /// them saw no activity, the simple mean of every amount is used instead.
    pub fn estimate(&self, amounts: &[DailyAmount], window: DateRange) -> AmountEstimate {
        let values: Vec<f64> = amounts.iter().map(|a| a.amount).collect();
        let Some(simple_mean) = mean(&values) else {
            return AmountEstimate {
                amount: 0.0,
                method: EstimateMethod::SimpleMean,
                months_used: 0,
                sample_size: 0,
            };
        };

        let averages = monthly_averages(amounts);
        let covered: Vec<(i32, u32)> = months_in_period(window.start, window.end)
            .into_iter()
            .filter(|(year, month)| month_within(*year, *month, window))
            .collect();
        let complete_months: Vec<f64> = covered
            .iter()
            .rev()
            .take(self.weights.len())
            .map_while(|key| averages.get(key).copied())
            .collect();

        if complete_months.len() < self.weights.len() {
            return AmountEstimate {
                amount: simple_mean,
                method: EstimateMethod::SimpleMean,
                months_used: 0,
                sample_size: values.len(),
            };
        }

        AmountEstimate {
            amount: weighted_average(&complete_months, self.weights),
            method: EstimateMethod::RecencyWeighted,
            months_used: complete_months.len(),
            sample_size: values.len(),
        }
    }
}

fn month_within(year: i32, month: u32, window: DateRange) -> bool {
    match (NaiveDate::from_ymd_opt(year, month, 1), last_day_of_month(year, month)) {
        (Some(first), Some(last)) => window.start <= first && last <= window.end,
        _ => false,
    }
}

/// Sum of value x weight over the total weight. Both slices are most-recent-first.
pub fn weighted_average(values: &[f64], weights: &[f64]) -> f64 {
    let (weighted_sum, total_weight) = values
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(sum, total), (value, weight)| {
            (sum + value * weight, total + weight)
        });

    if total_weight == 0.0 {
        0.0
    } else {
        weighted_sum / total_weight
    }
}

/// Average transaction-date amount per calendar month, keyed by (year, month).
pub fn monthly_averages(amounts: &[DailyAmount]) -> BTreeMap<(i32, u32), f64> {
    let mut buckets: BTreeMap<(i32, u32), Vec<f64>> = BTreeMap::new();
    for amount in amounts {
        buckets
            .entry((amount.date.year(), amount.date.month()))
            .or_default()
            .push(amount.amount);
    }

    buckets
        .into_iter()
        .filter_map(|(key, values)| mean(&values).map(|average| (key, average)))
        .collect()
}

pub fn amount_trend(amounts: &[DailyAmount]) -> Option<AmountTrend> {
    let averages = monthly_averages(amounts);
    if averages.len() < 2 {
        return None;
    }

    let first = averages.values().next()?.abs();
    let last = averages.values().next_back()?.abs();

    if first < f64::EPSILON {
        return Some(if last < f64::EPSILON {
            AmountTrend::Stable
        } else {
            AmountTrend::Rising
        });
    }

    let change = (last - first) / first;
    Some(if change > TREND_THRESHOLD {
        AmountTrend::Rising
    } else if change < -TREND_THRESHOLD {
        AmountTrend::Falling
    } else {
        AmountTrend::Stable
    })
}

/// The occurrences that fall on the pattern's timing; all of them if none do.
pub fn matching_amounts(
    pattern: &RecurrencePattern,
    occurrences: &[DailyAmount],
    tolerance: u32,
) -> Vec<DailyAmount> {
    let near = |date: NaiveDate, target: &DayOfMonth| target.days_from(date) <= tolerance as i64;

    let matched: Vec<DailyAmount> = occurrences
        .iter()
        .filter(|o| match pattern {
            RecurrencePattern::Daily {
                weekdays_only: true,
            } => !is_weekend(o.date),
            RecurrencePattern::Weekly { weekday } | RecurrencePattern::Biweekly { weekday, .. } => {
                o.date.weekday() == *weekday
            }
            RecurrencePattern::Monthly {
                days: MonthlyDays::Single(day),
            } => near(o.date, day),
            RecurrencePattern::Monthly {
                days: MonthlyDays::Twice(first, second),
            } => near(o.date, first) || near(o.date, second),
            RecurrencePattern::Quarterly { day, .. } | RecurrencePattern::Annual { day, .. } => {
                near(o.date, day)
            }
            RecurrencePattern::Daily {
                weekdays_only: false,
            }
            | RecurrencePattern::Irregular => true,
        })
        .copied()
        .collect();

    if matched.is_empty() {
        occurrences.to_vec()
    } else {
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn amt(date: NaiveDate, amount: f64) -> DailyAmount {
        DailyAmount {
            date,
            amount,
            transaction_count: 1,
        }
    }

    #[test]
    fn test_recency_weighted_three_months() {
        let amounts = vec![
            amt(d(2025, 6, 15), 40_000.0),
            amt(d(2025, 7, 15), 42_000.0),
            amt(d(2025, 8, 15), 44_000.0),
        ];
        let weights = [2.0, 1.0, 1.0];
        let estimator = AmountEstimator::new(&weights).unwrap();
        let estimate = estimator.estimate(&amounts, DateRange::new(d(2025, 6, 1), d(2025, 9, 1)));
        assert_eq!(estimate.method, EstimateMethod::RecencyWeighted);
        assert_eq!(estimate.months_used, 3);
        assert!((estimate.amount - 42_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_current_month_is_ignored() {
        let amounts = vec![
            amt(d(2025, 5, 15), 10.0),
            amt(d(2025, 6, 15), 20.0),
            amt(d(2025, 7, 15), 30.0),
            amt(d(2025, 8, 15), 1_000.0),
        ];
        let weights = [2.0, 1.0, 1.0];
        let estimate = AmountEstimator::new(&weights)
            .unwrap()
            .estimate(&amounts, DateRange::new(d(2025, 5, 1), d(2025, 8, 20)));
        assert_eq!(estimate.method, EstimateMethod::RecencyWeighted);
        assert!((estimate.amount - (30.0 * 2.0 + 20.0 + 10.0) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_history_falls_back_to_mean() {
        let amounts = vec![amt(d(2025, 7, 1), 100.0), amt(d(2025, 8, 1), 200.0)];
        let weights = [2.0, 1.0, 1.0];
        let estimate = AmountEstimator::new(&weights)
            .unwrap()
            .estimate(&amounts, DateRange::new(d(2025, 7, 1), d(2025, 9, 30)));
        assert_eq!(estimate.method, EstimateMethod::SimpleMean);
        assert_eq!(estimate.amount, 150.0);
    }

    #[test]
    fn test_month_without_activity_falls_back_to_mean() {
        let amounts = vec![
            amt(d(2025, 2, 10), -300.0),
            amt(d(2025, 5, 10), -300.0),
            amt(d(2025, 8, 10), -600.0),
        ];
        let weights = [2.0, 1.0, 1.0];
        let estimate = AmountEstimator::new(&weights)
            .unwrap()
            .estimate(&amounts, DateRange::new(d(2025, 1, 1), d(2025, 8, 31)));
        assert_eq!(estimate.method, EstimateMethod::SimpleMean);
        assert_eq!(estimate.amount, -400.0);
    }

    #[test]
    fn test_partly_covered_month_is_not_complete() {
        let amounts = vec![
            amt(d(2025, 6, 15), 999.0),
            amt(d(2025, 7, 15), 10.0),
            amt(d(2025, 8, 15), 20.0),
            amt(d(2025, 9, 15), 30.0),
        ];
        let weights = [2.0, 1.0, 1.0];
        let estimator = AmountEstimator::new(&weights).unwrap();

        let full = estimator.estimate(&amounts, DateRange::new(d(2025, 6, 10), d(2025, 9, 30)));
        assert_eq!(full.method, EstimateMethod::RecencyWeighted);
        assert!((full.amount - 22.5).abs() < 1e-9);

        let short = estimator.estimate(&amounts, DateRange::new(d(2025, 6, 10), d(2025, 8, 31)));
        assert_eq!(short.method, EstimateMethod::SimpleMean);
    }

    #[test]
    fn test_matching_amounts_across_month_boundary() {
        let occurrences = vec![
            amt(d(2025, 6, 1), -100.0),
            amt(d(2025, 6, 14), -5.0),
            amt(d(2025, 8, 31), -110.0),
        ];
        let pattern = RecurrencePattern::Monthly {
            days: MonthlyDays::Single(DayOfMonth::Day(1)),
        };
        let matched = matching_amounts(&pattern, &occurrences, 2);
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|o| o.amount != -5.0));
    }

    #[test]
    fn test_empty_history_is_zero() {
        let weights = [1.0];
        let estimate = AmountEstimator::new(&weights)
            .unwrap()
            .estimate(&[], DateRange::new(d(2025, 7, 1), d(2025, 9, 30)));
        assert_eq!(estimate.amount, 0.0);
        assert_eq!(estimate.sample_size, 0);
    }

    #[test]
    fn test_month_average_uses_each_date() {
        let amounts = vec![amt(d(2025, 7, 1), 100.0), amt(d(2025, 7, 15), 300.0)];
        let averages = monthly_averages(&amounts);
        assert_eq!(averages.get(&(2025, 7)), Some(&200.0));
    }

    #[test]
    fn test_weighted_average() {
        assert!((weighted_average(&[44.0, 42.0, 40.0], &[2.0, 1.0, 1.0]) - 42.5).abs() < 1e-9);
        assert_eq!(weighted_average(&[], &[]), 0.0);
    }

    #[test]
    fn test_matching_amounts_filters_to_weekday() {
        let occurrences = vec![
            amt(d(2025, 8, 4), 100.0),
            amt(d(2025, 8, 6), 5.0),
            amt(d(2025, 8, 11), 110.0),
        ];
        let pattern = RecurrencePattern::Weekly {
            weekday: Weekday::Mon,
        };
        let matched = matching_amounts(&pattern, &occurrences, 2);
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|o| o.date.weekday() == Weekday::Mon));
    }

    #[test]
    fn test_amount_trend() {
        let growing = vec![amt(d(2025, 6, 1), -100.0), amt(d(2025, 8, 1), -150.0)];
        assert_eq!(amount_trend(&growing), Some(AmountTrend::Rising));
        let stable = vec![amt(d(2025, 6, 1), 100.0), amt(d(2025, 8, 1), 105.0)];
        assert_eq!(amount_trend(&stable), Some(AmountTrend::Stable));
        assert_eq!(amount_trend(&stable[..1]), None);
    }
}
