use crate::error::Result;
use crate::schema::{ForecastMethod, ForecastRecord, Frequency, RecurrencePattern};
use chrono::NaiveDate;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Manual corrections layered on top of detected patterns and generated records.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ForecastOverrides {
    #[schemars(
        description = "Fixed amounts used instead of the estimated amount. Records generated while an override is active are marked manual."
    )]
    #[serde(default)]
    pub amount_overrides: Vec<AmountOverride>,

    #[schemars(
        description = "Recurrence patterns that replace the detected pattern for a vendor group, e.g. to schedule an irregular group."
    )]
    #[serde(default)]
    pub pattern_overrides: Vec<PatternOverride>,

    #[schemars(
        description = "Ordered edits to individual generated records. Applied after generation; locked records are never changed."
    )]
    #[serde(default)]
    pub adjustments: Vec<OccurrenceAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AmountOverride {
    pub vendor_group: String,

    #[schemars(description = "Signed amount per occurrence. Negative for outflows.")]
    pub amount: f64,

    #[schemars(description = "First date (YYYY-MM-DD) the override applies to. Open-ended when absent.")]
    #[serde(default)]
    pub effective_from: Option<NaiveDate>,

    #[schemars(description = "Last date (YYYY-MM-DD) the override applies to. Open-ended when absent.")]
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,

    #[serde(default)]
    pub reason: Option<String>,
}

impl AmountOverride {
    pub fn is_active(&self, date: NaiveDate) -> bool {
        self.effective_from.map_or(true, |from| from <= date)
            && self.expires_on.map_or(true, |until| date <= until)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatternOverride {
    pub vendor_group: String,
    pub pattern: RecurrencePattern,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OccurrenceAdjustment {
    /// Replace the forecasted amount of one record.
    SetAmount {
        vendor_group: String,
        date: NaiveDate,
        amount: f64,
    },

    /// Move one record to another date. Lands on an existing unlocked record by summing into it.
    ShiftDate {
        vendor_group: String,
        from: NaiveDate,
        to: NaiveDate,
    },

    /// Drop one record from the forecast.
    Skip {
        vendor_group: String,
        date: NaiveDate,
    },

    /// Hand-entered occurrence, typically for an irregular group.
    Add {
        vendor_group: String,
        date: NaiveDate,
        #[schemars(description = "Signed amount. Added to the record if one already exists on the date.")]
        amount: f64,
    },
}

impl OccurrenceAdjustment {
    pub fn vendor_group(&self) -> &str {
        match self {
            OccurrenceAdjustment::SetAmount { vendor_group, .. }
            | OccurrenceAdjustment::ShiftDate { vendor_group, .. }
            | OccurrenceAdjustment::Skip { vendor_group, .. }
            | OccurrenceAdjustment::Add { vendor_group, .. } => vendor_group,
        }
    }
}

impl ForecastOverrides {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The first override for `vendor_group` active on `date`.
    pub fn amount_override_for(&self, vendor_group: &str, date: NaiveDate) -> Option<&AmountOverride> {
        self.amount_overrides
            .iter()
            .find(|o| o.vendor_group == vendor_group && o.is_active(date))
    }

    pub fn pattern_override_for(&self, vendor_group: &str) -> Option<&PatternOverride> {
        self.pattern_overrides
            .iter()
            .find(|o| o.vendor_group == vendor_group)
    }

    /// Applies every adjustment for `client_id`'s records in order and returns how many took effect.
    ///
    /// Records are left sorted by (vendor group, date).
    pub fn apply_adjustments(&self, client_id: &str, records: &mut Vec<ForecastRecord>) -> usize {
        let mut applied = 0;
        for adjustment in &self.adjustments {
            if apply_single_adjustment(client_id, records, adjustment) {
                applied += 1;
            } else {
                debug!("Adjustment had no effect: {:?}", adjustment);
            }
        }

        records.sort_by(|a, b| a.key().cmp(&b.key()));
        applied
    }

    pub fn json_schema() -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(schemars::schema_for!(ForecastOverrides))
    }
}

fn apply_single_adjustment(
    client_id: &str,
    records: &mut Vec<ForecastRecord>,
    adjustment: &OccurrenceAdjustment,
) -> bool {
    let group = adjustment.vendor_group();

    match adjustment {
        OccurrenceAdjustment::SetAmount { date, amount, .. } => {
            match find_unlocked_mut(records, client_id, group, *date) {
                Some(record) => {
                    record.forecasted_amount = *amount;
                    record.method = ForecastMethod::Manual;
                    true
                }
                None => false,
            }
        }

        OccurrenceAdjustment::Skip { date, .. } => {
            let before = records.len();
            records.retain(|r| {
                r.is_locked || !(r.client_id == client_id && r.vendor_group == group && r.date == *date)
            });
            records.len() < before
        }

        OccurrenceAdjustment::ShiftDate { from, to, .. } => {
            if is_locked_at(records, client_id, group, *to) {
                warn!(
                    "Not shifting '{}' from {} to {}: target date is locked",
                    group, from, to
                );
                return false;
            }

            let Some(index) = records.iter().position(|r| {
                !r.is_locked && r.client_id == client_id && r.vendor_group == group && r.date == *from
            }) else {
                return false;
            };

            let mut moved = records.remove(index);
            moved.method = ForecastMethod::Manual;
            match find_unlocked_mut(records, client_id, group, *to) {
                Some(existing) => {
                    existing.forecasted_amount += moved.forecasted_amount;
                    existing.method = ForecastMethod::Manual;
                }
                None => {
                    moved.date = *to;
                    records.push(moved);
                }
            }
            true
        }

        OccurrenceAdjustment::Add { date, amount, .. } => {
            if is_locked_at(records, client_id, group, *date) {
                warn!("Not adding to '{}' on {}: date is locked", group, date);
                return false;
            }

            let pattern_type = records
                .iter()
                .find(|r| r.client_id == client_id && r.vendor_group == group)
                .map(|r| r.pattern_type)
                .unwrap_or(Frequency::Irregular);

            match find_unlocked_mut(records, client_id, group, *date) {
                Some(existing) => {
                    existing.forecasted_amount += amount;
                    existing.method = ForecastMethod::Manual;
                }
                None => records.push(ForecastRecord::new(
                    client_id,
                    group,
                    *date,
                    *amount,
                    pattern_type,
                    ForecastMethod::Manual,
                )),
            }
            true
        }
    }
}

fn find_unlocked_mut<'a>(
    records: &'a mut [ForecastRecord],
    client_id: &str,
    group: &str,
    date: NaiveDate,
) -> Option<&'a mut ForecastRecord> {
    records.iter_mut().find(|r| {
        !r.is_locked && r.client_id == client_id && r.vendor_group == group && r.date == date
    })
}

fn is_locked_at(records: &[ForecastRecord], client_id: &str, group: &str, date: NaiveDate) -> bool {
    records
        .iter()
        .any(|r| r.is_locked && r.client_id == client_id && r.vendor_group == group && r.date == date)
}
