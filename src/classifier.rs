//! Maps interval statistics to a recurrence pattern and a confidence score.
//!
//! Frequency comes from the median gap and timing from the calendar positions
//! of the observed dates. Confidence measures how tightly the gaps sit around
//! the median, discounted for short histories.

use crate::config::ForecastConfig;
use crate::estimator::{amount_trend, AmountTrend};
use crate::intervals::{DailyAmount, IntervalStats};
use crate::schema::{
    DayOfMonth, Frequency, MonthlyDays, PatternAnalysis, PatternSource, RecurrencePattern,
    VendorGroup,
};
use crate::utils::{is_last_day_of_month, is_weekend, mean, median};
use chrono::{Datelike, NaiveDate, Weekday};
use log::debug;
use std::collections::BTreeMap;

/// Two day-of-month clusters closer than this are the same payment drifting, not two payments.
const MIN_CLUSTER_SEPARATION_DAYS: u32 = 7;

/// Below this modal-weekday share a biweekly-looking series is checked for a semi-monthly schedule.
const WEAK_WEEKDAY_SHARE: f64 = 0.5;

/// Share of occurrences two day-of-month clusters must jointly cover to call a series semi-monthly.
const SEMI_MONTHLY_COVERAGE: f64 = 0.8;

/// Intervals per average month a two-day monthly timing needs; a monthly payer sits near 1.
const MIN_SEMI_MONTHLY_RATE: f64 = 1.5;

const AVERAGE_MONTH_DAYS: f64 = 30.4375;

pub struct PatternClassifier<'a> {
    config: &'a ForecastConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayCluster {
    pub day: DayOfMonth,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ModalWeekday {
    weekday: Weekday,
    share: f64,
    /// Most recent occurrence on the modal weekday.
    anchor: NaiveDate,
}

impl<'a> PatternClassifier<'a> {
    pub fn new(config: &'a ForecastConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, group: &VendorGroup, stats: &IntervalStats) -> PatternAnalysis {
        let daily_totals: Vec<f64> = stats.occurrences.iter().map(|o| o.amount).collect();
        let average_amount = mean(&daily_totals).unwrap_or(0.0);

        let gaps = match stats.require_gaps(&group.group_name) {
            Ok(gaps) => gaps,
            Err(e) => {
                debug!("{}", e);
                let note = format!(
                    "Insufficient data: {} occurrence(s) in the last {} days; needs manual forecast",
                    stats.occurrence_count(),
                    self.config.lookback_days
                );
                return self.irregular(group, stats, average_amount, None, note);
            }
        };

        let gap_values: Vec<f64> = gaps.iter().map(|g| *g as f64).collect();
        let median_gap = median(&gap_values).unwrap_or(0.0);

        if stats.occurrence_count() < self.config.min_occurrences {
            let note = format!(
                "Only {} occurrence(s) in the last {} days (need {}); needs manual forecast",
                stats.occurrence_count(),
                self.config.lookback_days,
                self.config.min_occurrences
            );
            return self.irregular(group, stats, average_amount, Some(median_gap), note);
        }

        let frequency = frequency_for_median_gap(median_gap);
        let pattern = self.detect_timing(frequency, &stats.occurrences);
        if pattern == RecurrencePattern::Irregular {
            let note = format!(
                "No stable timing for a {} interval of {:.1} days; needs manual forecast",
                frequency, median_gap
            );
            return self.irregular(group, stats, average_amount, Some(median_gap), note);
        }

        let consistency = match pattern {
            RecurrencePattern::Daily {
                weekdays_only: true,
            } => {
                let business_gaps = business_day_gaps(&stats.occurrences);
                let business_median = median(&business_gaps).unwrap_or(median_gap);
                interval_consistency(&business_gaps, business_median)
            }
            _ => interval_consistency(&gap_values, median_gap),
        };
        let completeness = completeness_factor(
            stats.observed_span_days(),
            median_gap,
            self.config.lookback_days,
            self.config.completeness_cycles,
        );
        let confidence = (consistency * completeness).clamp(0.0, 1.0);

        let mut note = format!(
            "{} on {}: {} occurrences, median gap {:.1} days, interval consistency {:.2}, history completeness {:.2}",
            pattern.frequency(),
            pattern.timing_descriptor().unwrap_or_default(),
            stats.occurrence_count(),
            median_gap,
            consistency,
            completeness
        );
        if pattern.frequency() != frequency {
            note.push_str("; two stable days of month override the biweekly interval");
        }
        match amount_trend(&stats.occurrences) {
            Some(AmountTrend::Rising) => note.push_str("; amounts rising"),
            Some(AmountTrend::Falling) => note.push_str("; amounts falling"),
            Some(AmountTrend::Stable) => note.push_str("; amounts stable"),
            None => {}
        }

        debug!(
            "Classified '{}' as {} ({:?}) with confidence {:.2}",
            group.group_name,
            pattern.frequency(),
            pattern.timing_descriptor(),
            confidence
        );

        PatternAnalysis {
            client_id: group.client_id.clone(),
            vendor_group: group.group_name.clone(),
            pattern,
            confidence,
            sample_size: stats.occurrence_count(),
            transaction_count: stats.transaction_count,
            skipped_invalid_dates: stats.skipped_invalid,
            date_range: stats.date_range(),
            median_gap_days: Some(median_gap),
            average_amount,
            note,
            as_of: stats.window.end,
            lookback_days: self.config.lookback_days,
            source: PatternSource::Detected,
        }
    }

    fn irregular(
        &self,
        group: &VendorGroup,
        stats: &IntervalStats,
        average_amount: f64,
        median_gap_days: Option<f64>,
        note: String,
    ) -> PatternAnalysis {
        PatternAnalysis {
            client_id: group.client_id.clone(),
            vendor_group: group.group_name.clone(),
            pattern: RecurrencePattern::Irregular,
            confidence: 0.0,
            sample_size: stats.occurrence_count(),
            transaction_count: stats.transaction_count,
            skipped_invalid_dates: stats.skipped_invalid,
            date_range: stats.date_range(),
            median_gap_days,
            average_amount,
            note,
            as_of: stats.window.end,
            lookback_days: self.config.lookback_days,
            source: PatternSource::Detected,
        }
    }

    fn detect_timing(&self, frequency: Frequency, occurrences: &[DailyAmount]) -> RecurrencePattern {
        let Some(modal) = modal_weekday(occurrences) else {
            return RecurrencePattern::Irregular;
        };

        match frequency {
            Frequency::Daily => RecurrencePattern::Daily {
                weekdays_only: falls_on_weekdays_only(occurrences),
            },
            Frequency::Weekly => RecurrencePattern::Weekly {
                weekday: modal.weekday,
            },
            Frequency::Biweekly => {
                if modal.share < WEAK_WEEKDAY_SHARE {
                    if let Some((days @ MonthlyDays::Twice(..), coverage)) =
                        self.monthly_days(occurrences)
                    {
                        if coverage >= SEMI_MONTHLY_COVERAGE {
                            return RecurrencePattern::Monthly { days };
                        }
                    }
                }
                RecurrencePattern::Biweekly {
                    weekday: modal.weekday,
                    anchor: modal.anchor,
                }
            }
            Frequency::Monthly => match self.monthly_days(occurrences) {
                Some((days, _)) => RecurrencePattern::Monthly { days },
                None => RecurrencePattern::Irregular,
            },
            Frequency::Quarterly | Frequency::Annual => {
                let modulus = if frequency == Frequency::Quarterly { 3 } else { 12 };
                let day = month_day_clusters(occurrences, self.config.cluster_tolerance_days)
                    .first()
                    .map(|c| c.day);
                match (modal_month(occurrences, modulus), day) {
                    (Some(month), Some(day)) if frequency == Frequency::Quarterly => {
                        RecurrencePattern::Quarterly { month, day }
                    }
                    (Some(month), Some(day)) => RecurrencePattern::Annual { month, day },
                    _ => RecurrencePattern::Irregular,
                }
            }
            Frequency::Irregular => RecurrencePattern::Irregular,
        }
    }

    /// Day(s) of month the series recurs on, with the share of occurrences they cover.
    ///
    /// Two days are only reported when they sit at least a week apart around the month
    /// boundary and the series pays about twice per month.
    fn monthly_days(&self, occurrences: &[DailyAmount]) -> Option<(MonthlyDays, f64)> {
        let clusters = month_day_clusters(occurrences, self.config.cluster_tolerance_days);
        let total = occurrences.len() as f64;
        let first = clusters.first()?;
        let first_share = first.count as f64 / total;

        if let Some(second) = clusters.get(1) {
            let second_share = second.count as f64 / total;
            let threshold = self.config.bimodal_cluster_share;
            let separated = circular_day_distance(first.day.position(), second.day.position())
                >= MIN_CLUSTER_SEPARATION_DAYS;
            let twice_monthly = occurrences_per_month(occurrences) >= MIN_SEMI_MONTHLY_RATE;

            if first_share >= threshold && second_share >= threshold && separated && twice_monthly {
                let (early, late) = if first.day.position() <= second.day.position() {
                    (first.day, second.day)
                } else {
                    (second.day, first.day)
                };
                return Some((MonthlyDays::Twice(early, late), first_share + second_share));
            }
        }

        Some((MonthlyDays::Single(first.day), first_share))
    }
}

/// Inclusive upper bounds: 1.5 daily, 8 weekly, 17 biweekly, 35 monthly, 100 quarterly.
pub fn frequency_for_median_gap(median_gap: f64) -> Frequency {
    if median_gap <= 1.5 {
        Frequency::Daily
    } else if median_gap <= 8.0 {
        Frequency::Weekly
    } else if median_gap <= 17.0 {
        Frequency::Biweekly
    } else if median_gap <= 35.0 {
        Frequency::Monthly
    } else if median_gap <= 100.0 {
        Frequency::Quarterly
    } else {
        Frequency::Annual
    }
}

/// 1 - (mean absolute deviation of gaps from the median) / median, clamped to [0, 1].
pub fn interval_consistency(gaps: &[f64], median_gap: f64) -> f64 {
    if gaps.is_empty() || median_gap <= 0.0 {
        return 0.0;
    }
    let deviations: Vec<f64> = gaps.iter().map(|g| (g - median_gap).abs()).collect();
    let mad = mean(&deviations).unwrap_or(0.0);
    (1.0 - mad / median_gap).clamp(0.0, 1.0)
}

/// Observed span over the span a complete history would cover: the lookback
/// window, or `cycles` median intervals when that is shorter.
pub fn completeness_factor(span_days: i64, median_gap: f64, lookback_days: u32, cycles: u32) -> f64 {
    let required = (cycles as f64 * median_gap)
        .min(lookback_days as f64)
        .max(1.0);
    (span_days as f64 / required).clamp(0.0, 1.0)
}

/// Weekend dates make up less than half their all-days share.
fn falls_on_weekdays_only(occurrences: &[DailyAmount]) -> bool {
    let weekend = occurrences.iter().filter(|o| is_weekend(o.date)).count() as f64;
    let expected_if_all_days = occurrences.len() as f64 * 2.0 / 7.0;
    weekend < expected_if_all_days / 2.0
}

/// Gaps counted in Mon-Fri days, so a Friday-to-Monday step is one day.
fn business_day_gaps(occurrences: &[DailyAmount]) -> Vec<f64> {
    occurrences
        .windows(2)
        .map(|pair| {
            pair[0]
                .date
                .iter_days()
                .skip(1)
                .take_while(|d| *d <= pair[1].date)
                .filter(|d| !is_weekend(*d))
                .count() as f64
        })
        .collect()
}

fn modal_weekday(occurrences: &[DailyAmount]) -> Option<ModalWeekday> {
    let mut counts = [0usize; 7];
    for occurrence in occurrences {
        counts[occurrence.date.weekday().num_days_from_monday() as usize] += 1;
    }

    let max = *counts.iter().max()?;
    let anchor = occurrences
        .iter()
        .rev()
        .find(|o| counts[o.date.weekday().num_days_from_monday() as usize] == max)?
        .date;

    Some(ModalWeekday {
        weekday: anchor.weekday(),
        share: max as f64 / occurrences.len() as f64,
        anchor,
    })
}

/// Month of the most recent occurrence in the modal month-phase (`modulus` 3 for quarters, 12 for years).
fn modal_month(occurrences: &[DailyAmount], modulus: u32) -> Option<u32> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for occurrence in occurrences {
        *counts.entry((occurrence.date.month() - 1) % modulus).or_default() += 1;
    }

    let max = *counts.values().max()?;
    occurrences
        .iter()
        .rev()
        .find(|o| counts.get(&((o.date.month() - 1) % modulus)) == Some(&max))
        .map(|o| o.date.month())
}

/// Distance between two day-of-month positions on a 31-day circle, so the 1st and the last day are neighbours.
fn circular_day_distance(a: u32, b: u32) -> u32 {
    let straight = a.abs_diff(b);
    straight.min(31 - straight)
}

/// Intervals per average-length month across the observed span.
fn occurrences_per_month(occurrences: &[DailyAmount]) -> f64 {
    let (Some(first), Some(last)) = (occurrences.first(), occurrences.last()) else {
        return 0.0;
    };
    let span_days = (last.date - first.date).num_days() as f64;
    if span_days <= 0.0 {
        return 0.0;
    }
    (occurrences.len() - 1) as f64 / (span_days / AVERAGE_MONTH_DAYS)
}

/// Groups raw day-of-month values that sit within `tolerance` of each other; largest clusters first.
///
/// A cluster is `Last` only when every occurrence in it fell on its month's final day (Apr 30,
/// May 31, Feb 28); otherwise it is the cluster's most frequent day.
pub fn month_day_clusters(occurrences: &[DailyAmount], tolerance: u32) -> Vec<DayCluster> {
    // day -> (occurrences, occurrences on the month's last day)
    let mut by_day: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
    for occurrence in occurrences {
        let entry = by_day.entry(occurrence.date.day()).or_default();
        entry.0 += 1;
        if is_last_day_of_month(occurrence.date) {
            entry.1 += 1;
        }
    }

    let mut clusters = Vec::new();
    let mut current: Vec<(u32, usize, usize)> = Vec::new();

    for (day, (count, at_month_end)) in by_day {
        if let Some(&(previous, _, _)) = current.last() {
            if day - previous > tolerance {
                clusters.extend(collapse_cluster(&current));
                current.clear();
            }
        }
        current.push((day, count, at_month_end));
    }
    clusters.extend(collapse_cluster(&current));

    clusters.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.day.position().cmp(&b.day.position()))
    });
    clusters
}

fn collapse_cluster(members: &[(u32, usize, usize)]) -> Option<DayCluster> {
    let total: usize = members.iter().map(|(_, count, _)| count).sum();
    let at_month_end: usize = members.iter().map(|(_, _, last)| last).sum();
    let (day, _, _) = members
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))?;

    let day = if at_month_end == total {
        DayOfMonth::Last
    } else {
        DayOfMonth::Day(*day)
    };
    Some(DayCluster { day, count: total })
}
