use crate::schema::{DateRange, Transaction, VendorGroup};
use chrono::NaiveDate;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Transactions split by the vendor group that owns them.
#[derive(Debug, Clone, Default)]
pub struct PartitionedTransactions {
    /// One entry per active group, even when it saw no transactions.
    pub by_group: BTreeMap<String, Vec<Transaction>>,
    pub unassigned: usize,
}

/// Splits `transactions` across the active `groups`.
///
/// Rows for inactive groups, unknown groups or other clients are counted as unassigned.
pub fn partition_by_group(groups: &[VendorGroup], transactions: &[Transaction]) -> PartitionedTransactions {
    let mut by_group: BTreeMap<String, Vec<Transaction>> = groups
        .iter()
        .filter(|g| g.active)
        .map(|g| (g.group_name.clone(), Vec::new()))
        .collect();

    let mut unassigned = 0;
    for transaction in transactions {
        match groups.iter().find(|g| g.active && g.owns(transaction)) {
            Some(group) => by_group
                .entry(group.group_name.clone())
                .or_default()
                .push(transaction.clone()),
            None => unassigned += 1,
        }
    }

    if unassigned > 0 {
        debug!("{} transaction(s) did not belong to an active vendor group", unassigned);
    }

    PartitionedTransactions {
        by_group,
        unassigned,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActualTotal {
    pub amount: f64,
    pub transaction_count: usize,
}

/// One client's actual activity for a reconciliation window, summed per (vendor group, date).
#[derive(Debug, Clone, Default)]
pub struct GroupedActuals {
    pub totals: BTreeMap<(String, NaiveDate), ActualTotal>,
    pub transaction_count: usize,
    pub skipped_invalid: usize,
    pub skipped_other_client: usize,
    pub skipped_outside_window: usize,
}

impl GroupedActuals {
    pub fn get(&self, vendor_group: &str, date: NaiveDate) -> Option<&ActualTotal> {
        self.totals.get(&(vendor_group.to_string(), date))
    }
}

pub fn group_actuals(client_id: &str, window: DateRange, actuals: &[Transaction]) -> GroupedActuals {
    let mut grouped = GroupedActuals::default();

    for actual in actuals {
        if actual.client_id != client_id {
            grouped.skipped_other_client += 1;
            continue;
        }

        let date = match actual.parsed_date() {
            Ok(date) => date,
            Err(e) => {
                warn!("Skipping actual for '{}': {}", actual.vendor_group, e);
                grouped.skipped_invalid += 1;
                continue;
            }
        };

        if !window.contains(date) {
            grouped.skipped_outside_window += 1;
            continue;
        }

        let total = grouped
            .totals
            .entry((actual.vendor_group.clone(), date))
            .or_insert(ActualTotal {
                amount: 0.0,
                transaction_count: 0,
            });
        total.amount += actual.amount;
        total.transaction_count += 1;
        grouped.transaction_count += 1;
    }

    grouped
}
