use crate::config::ForecastConfig;
use crate::schema::ForecastRecord;
use crate::utils::week_start_for;
use chrono::{Days, NaiveDate};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One client's cash position over one week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekBalance {
    pub client_id: String,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub beginning_balance: f64,
    pub inflows: f64,
    /// Positive magnitude of money leaving.
    pub outflows: f64,
    pub net_change: f64,
    pub ending_balance: f64,
    /// Set once the week has been reconciled; its figures are then frozen.
    pub is_locked: bool,
}

pub struct CashBalancer<'a> {
    config: &'a ForecastConfig,
}

impl<'a> CashBalancer<'a> {
    pub fn new(config: &'a ForecastConfig) -> Self {
        Self { config }
    }

    /// Balances for `weeks` consecutive weeks, the first one containing `from`.
    ///
    /// Each week starts from the previous week's ending balance; the first starts from
    /// `opening_balance`. Locked records count at their actual amount, the rest at forecast.
    pub fn compute(
        &self,
        client_id: &str,
        opening_balance: f64,
        from: NaiveDate,
        weeks: u32,
        records: &[ForecastRecord],
    ) -> Vec<WeekBalance> {
        let first = week_start_for(from, self.config.week_start);
        let mut carried = opening_balance;

        (0..weeks as u64)
            .filter_map(|i| first.checked_add_days(Days::new(i * 7)))
            .map(|week_start| {
                let week = self.week_balance(client_id, week_start, carried, records);
                carried = week.ending_balance;
                week
            })
            .collect()
    }

    /// Recomputes the week starting `from_week` and every later unlocked week.
    ///
    /// Earlier weeks and later locked weeks keep their stored figures; the week after a locked
    /// week starts from that locked week's ending balance.
    pub fn propagate_from(
        &self,
        balances: &[WeekBalance],
        records: &[ForecastRecord],
        from_week: NaiveDate,
    ) -> Vec<WeekBalance> {
        let mut ordered: Vec<&WeekBalance> = balances.iter().collect();
        ordered.sort_by_key(|w| w.week_start);

        let mut carried: Option<f64> = None;
        let mut recomputed = 0;
        let result: Vec<WeekBalance> = ordered
            .into_iter()
            .map(|week| {
                let frozen =
                    week.week_start < from_week || (week.is_locked && week.week_start != from_week);
                if frozen {
                    carried = Some(week.ending_balance);
                    return week.clone();
                }

                let beginning = carried.unwrap_or(week.beginning_balance);
                let mut updated = self.week_balance(&week.client_id, week.week_start, beginning, records);
                updated.is_locked = week.is_locked;
                carried = Some(updated.ending_balance);
                recomputed += 1;
                updated
            })
            .collect();

        debug!("Recomputed {} week balance(s) from {}", recomputed, from_week);
        result
    }

    /// Per-client balances, clients computed in parallel and each one chronologically.
    pub fn compute_all(
        &self,
        opening_balances: &BTreeMap<String, f64>,
        from: NaiveDate,
        weeks: u32,
        records: &[ForecastRecord],
    ) -> BTreeMap<String, Vec<WeekBalance>> {
        opening_balances
            .par_iter()
            .map(|(client_id, opening)| {
                let client_records: Vec<ForecastRecord> = records
                    .iter()
                    .filter(|r| &r.client_id == client_id)
                    .cloned()
                    .collect();
                (
                    client_id.clone(),
                    self.compute(client_id, *opening, from, weeks, &client_records),
                )
            })
            .collect()
    }

    fn week_balance(
        &self,
        client_id: &str,
        week_start: NaiveDate,
        beginning_balance: f64,
        records: &[ForecastRecord],
    ) -> WeekBalance {
        let week_end = week_start.checked_add_days(Days::new(6)).unwrap_or(NaiveDate::MAX);

        let (inflows, outflows) = records
            .iter()
            .filter(|r| r.client_id == client_id && week_start <= r.date && r.date <= week_end)
            .map(ForecastRecord::effective_amount)
            .fold((0.0, 0.0), |(inflows, outflows), amount| {
                if amount >= 0.0 {
                    (inflows + amount, outflows)
                } else {
                    (inflows, outflows - amount)
                }
            });

        let net_change = inflows - outflows;
        WeekBalance {
            client_id: client_id.to_string(),
            week_start,
            week_end,
            beginning_balance,
            inflows,
            outflows,
            net_change,
            ending_balance: beginning_balance + net_change,
            is_locked: false,
        }
    }
}

pub fn compute_balances(
    config: &ForecastConfig,
    client_id: &str,
    opening_balance: f64,
    from: NaiveDate,
    weeks: u32,
    records: &[ForecastRecord],
) -> Vec<WeekBalance> {
    let balancer = CashBalancer::new(config);
    balancer.compute(client_id, opening_balance, from, weeks, records)
}

pub fn propagate_balances(
    config: &ForecastConfig,
    balances: &[WeekBalance],
    records: &[ForecastRecord],
    from_week: NaiveDate,
) -> Vec<WeekBalance> {
    let balancer = CashBalancer::new(config);
    balancer.propagate_from(balances, records, from_week)
}

/// Freezes the week starting at `week_start`. Returns false if no such week is stored.
pub fn lock_week(balances: &mut [WeekBalance], week_start: NaiveDate) -> bool {
    match balances.iter_mut().find(|w| w.week_start == week_start) {
        Some(week) => {
            week.is_locked = true;
            true
        }
        None => false,
    }
}
