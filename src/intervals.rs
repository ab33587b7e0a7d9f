use crate::error::{ForecastError, Result};
use crate::schema::{DateRange, Transaction};
use chrono::{Days, NaiveDate};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All of a group's activity on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyAmount {
    pub date: NaiveDate,
    pub amount: f64,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalStats {
    pub window: DateRange,
    /// One entry per distinct date, ascending.
    pub occurrences: Vec<DailyAmount>,
    /// Day gaps between consecutive occurrences.
    pub gaps: Vec<i64>,
    pub transaction_count: usize,
    pub raw_amounts: Vec<f64>,
    pub skipped_invalid: usize,
    pub skipped_outside_window: usize,
}

impl IntervalStats {
    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn date_range(&self) -> Option<DateRange> {
        let first = self.occurrences.first()?;
        let last = self.occurrences.last()?;
        Some(DateRange::new(first.date, last.date))
    }

    pub fn observed_span_days(&self) -> i64 {
        self.date_range().map(|r| r.span_days()).unwrap_or(0)
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.occurrences.iter().map(|o| o.date)
    }

    /// The gap list, or `InsufficientData` when fewer than two distinct dates were seen.
    pub fn require_gaps(&self, vendor_group: &str) -> Result<&[i64]> {
        if self.gaps.is_empty() {
            return Err(ForecastError::InsufficientData {
                vendor_group: vendor_group.to_string(),
                occurrences: self.occurrence_count(),
            });
        }
        Ok(&self.gaps)
    }
}

pub struct IntervalAnalyzer {
    lookback_days: u32,
}

impl IntervalAnalyzer {
    pub fn new(lookback_days: u32) -> Self {
        Self { lookback_days }
    }

    pub fn window_ending(&self, as_of: NaiveDate) -> DateRange {
        let start = as_of
            .checked_sub_days(Days::new(self.lookback_days as u64))
            .unwrap_or(NaiveDate::MIN);
        DateRange::new(start, as_of)
    }

    pub fn analyze(&self, transactions: &[Transaction], as_of: NaiveDate) -> IntervalStats {
        let window = self.window_ending(as_of);

        let mut by_date: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
        let mut raw_amounts = Vec::new();
        let mut skipped_invalid = 0;
        let mut skipped_outside_window = 0;

        for transaction in transactions {
            let date = match transaction.parsed_date() {
                Ok(date) => date,
                Err(e) => {
                    warn!(
                        "Skipping transaction for '{}': {}",
                        transaction.vendor_group, e
                    );
                    skipped_invalid += 1;
                    continue;
                }
            };

            if !window.contains(date) {
                skipped_outside_window += 1;
                continue;
            }

            let entry = by_date.entry(date).or_insert((0.0, 0));
            entry.0 += transaction.amount;
            entry.1 += 1;
            raw_amounts.push(transaction.amount);
        }

        let occurrences: Vec<DailyAmount> = by_date
            .into_iter()
            .map(|(date, (amount, transaction_count))| DailyAmount {
                date,
                amount,
                transaction_count,
            })
            .collect();

        let gaps: Vec<i64> = occurrences
            .windows(2)
            .map(|pair| (pair[1].date - pair[0].date).num_days())
            .collect();

        debug!(
            "Interval analysis over {}..{}: {} transactions on {} dates, {} invalid, {} outside window",
            window.start,
            window.end,
            raw_amounts.len(),
            occurrences.len(),
            skipped_invalid,
            skipped_outside_window
        );

        IntervalStats {
            window,
            occurrences,
            gaps,
            transaction_count: raw_amounts.len(),
            raw_amounts,
            skipped_invalid,
            skipped_outside_window,
        }
    }
}

/// Latest parseable date among `transactions`, used as the default analysis date.
pub fn latest_transaction_date(transactions: &[Transaction]) -> Option<NaiveDate> {
    transactions.iter().filter_map(|t| t.parsed_date().ok()).max()
}
