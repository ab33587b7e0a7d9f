use crate::error::Result;
use crate::utils::{days_in_month, month_name, ordinal, parse_transaction_date, weekday_name};
use chrono::{Datelike, Months, NaiveDate, Weekday};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A user-defined set of normalized vendor names forecast as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VendorGroup {
    pub client_id: String,

    #[schemars(description = "Unique per client. Transactions reference the group by this name.")]
    pub group_name: String,

    #[serde(default)]
    pub vendor_names: BTreeSet<String>,

    #[schemars(description = "True when the group's activity is money coming in (deposits, payouts).")]
    pub is_inflow: bool,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl VendorGroup {
    pub fn new(client_id: impl Into<String>, group_name: impl Into<String>, is_inflow: bool) -> Self {
        Self {
            client_id: client_id.into(),
            group_name: group_name.into(),
            vendor_names: BTreeSet::new(),
            is_inflow,
            active: true,
        }
    }

    #[must_use]
    pub fn with_vendors<I, S>(mut self, vendors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vendor_names.extend(vendors.into_iter().map(Into::into));
        self
    }

    pub fn owns(&self, transaction: &Transaction) -> bool {
        transaction.client_id == self.client_id && transaction.vendor_group == self.group_name
    }
}

/// A normalized transaction as delivered by the import collaborator.
///
/// The date is kept as raw text: a malformed date must only drop this row,
/// never the batch it arrived in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub client_id: String,
    pub vendor_group: String,
    pub date: String,
    pub amount: f64,
}

impl Transaction {
    pub fn new(
        client_id: impl Into<String>,
        vendor_group: impl Into<String>,
        date: impl Into<String>,
        amount: f64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            vendor_group: vendor_group.into(),
            date: date.into(),
            amount,
        }
    }

    pub fn parsed_date(&self) -> Result<NaiveDate> {
        parse_transaction_date(&self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Annual,
    Irregular,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Annual => "annual",
            Frequency::Irregular => "irregular",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DayOfMonth {
    #[schemars(description = "A specific day (1-31). Clamped to the last valid day of short months.")]
    Day(u32),

    #[schemars(description = "The last calendar day of the month.")]
    Last,
}

impl DayOfMonth {
    /// Calendar position used when comparing clusters; `Last` sorts after every numbered day.
    pub fn position(&self) -> u32 {
        match self {
            DayOfMonth::Day(day) => *day,
            DayOfMonth::Last => 31,
        }
    }

    pub fn resolve(&self, year: i32, month: u32) -> Option<NaiveDate> {
        let last = days_in_month(year, month)?;
        let day = match self {
            DayOfMonth::Day(day) => (*day).clamp(1, last),
            DayOfMonth::Last => last,
        };
        NaiveDate::from_ymd_opt(year, month, day)
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        self.resolve(date.year(), date.month()) == Some(date)
    }

    /// Days from `date` to the nearest date this day resolves to in the same or an adjacent month,
    /// so a payment on the 31st is one day from `Day(1)`.
    pub fn days_from(&self, date: NaiveDate) -> i64 {
        let first = date.with_day(1);
        [
            first.and_then(|f| f.checked_sub_months(Months::new(1))),
            first,
            first.and_then(|f| f.checked_add_months(Months::new(1))),
        ]
        .into_iter()
        .flatten()
        .filter_map(|month| self.resolve(month.year(), month.month()))
        .map(|resolved| (resolved - date).num_days().abs())
        .min()
        .unwrap_or(i64::MAX)
    }

    pub fn label(&self) -> String {
        match self {
            DayOfMonth::Day(day) => ordinal(*day),
            DayOfMonth::Last => "last-day".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MonthlyDays {
    Single(DayOfMonth),
    #[schemars(description = "Two recurring days per month, e.g. the 15th and the last day.")]
    Twice(DayOfMonth, DayOfMonth),
}

/// A recurrence class together with the timing it was observed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "frequency", rename_all = "snake_case")]
pub enum RecurrencePattern {
    Daily {
        weekdays_only: bool,
    },
    Weekly {
        #[schemars(with = "String")]
        weekday: Weekday,
    },
    Biweekly {
        #[schemars(with = "String")]
        weekday: Weekday,
        #[schemars(description = "A historical occurrence fixing which alternate week the payment falls in.")]
        anchor: NaiveDate,
    },
    Monthly {
        days: MonthlyDays,
    },
    Quarterly {
        #[schemars(description = "A calendar month (1-12) of one occurrence; every third month from it recurs.")]
        month: u32,
        day: DayOfMonth,
    },
    Annual {
        month: u32,
        day: DayOfMonth,
    },
    Irregular,
}

impl RecurrencePattern {
    pub fn frequency(&self) -> Frequency {
        match self {
            RecurrencePattern::Daily { .. } => Frequency::Daily,
            RecurrencePattern::Weekly { .. } => Frequency::Weekly,
            RecurrencePattern::Biweekly { .. } => Frequency::Biweekly,
            RecurrencePattern::Monthly { .. } => Frequency::Monthly,
            RecurrencePattern::Quarterly { .. } => Frequency::Quarterly,
            RecurrencePattern::Annual { .. } => Frequency::Annual,
            RecurrencePattern::Irregular => Frequency::Irregular,
        }
    }

    /// Human readable timing, e.g. "weekdays", "Monday", "15th-and-last-day".
    pub fn timing_descriptor(&self) -> Option<String> {
        match self {
            RecurrencePattern::Daily { weekdays_only: true } => Some("weekdays".to_string()),
            RecurrencePattern::Daily { weekdays_only: false } => Some("all-days".to_string()),
            RecurrencePattern::Weekly { weekday } | RecurrencePattern::Biweekly { weekday, .. } => {
                Some(weekday_name(*weekday).to_string())
            }
            RecurrencePattern::Monthly {
                days: MonthlyDays::Single(day),
            } => Some(day.label()),
            RecurrencePattern::Monthly {
                days: MonthlyDays::Twice(first, second),
            } => Some(format!("{}-and-{}", first.label(), second.label())),
            RecurrencePattern::Quarterly { month, day } | RecurrencePattern::Annual { month, day } => {
                Some(format!("{} {}", month_name(*month), day.label()))
            }
            RecurrencePattern::Irregular => None,
        }
    }

    /// True when `date` is one of the calendar dates this pattern recurs on.
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            RecurrencePattern::Daily { weekdays_only } => {
                !weekdays_only || date.weekday().num_days_from_monday() < 5
            }
            RecurrencePattern::Weekly { weekday } => date.weekday() == *weekday,
            RecurrencePattern::Biweekly { weekday, anchor } => {
                date.weekday() == *weekday && (date - *anchor).num_days().rem_euclid(14) == 0
            }
            RecurrencePattern::Monthly { days } => match days {
                MonthlyDays::Single(day) => day.matches(date),
                MonthlyDays::Twice(first, second) => first.matches(date) || second.matches(date),
            },
            RecurrencePattern::Quarterly { month, day } => {
                (date.month() as i32 - *month as i32).rem_euclid(3) == 0 && day.matches(date)
            }
            RecurrencePattern::Annual { month, day } => date.month() == *month && day.matches(date),
            RecurrencePattern::Irregular => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    Detected,
    Manual,
}

/// Result of classifying one vendor group at one analysis date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub client_id: String,
    pub vendor_group: String,
    pub pattern: RecurrencePattern,
    pub confidence: f64,
    /// Distinct transaction dates inside the window.
    pub sample_size: usize,
    pub transaction_count: usize,
    pub skipped_invalid_dates: usize,
    pub date_range: Option<DateRange>,
    pub median_gap_days: Option<f64>,
    pub average_amount: f64,
    pub note: String,
    pub as_of: NaiveDate,
    pub lookback_days: u32,
    pub source: PatternSource,
}

impl PatternAnalysis {
    pub fn frequency(&self) -> Frequency {
        self.pattern.frequency()
    }

    pub fn timing_descriptor(&self) -> Option<String> {
        self.pattern.timing_descriptor()
    }

    /// Irregular groups get no generated records and must be forecast by hand.
    pub fn needs_manual_forecast(&self) -> bool {
        self.pattern == RecurrencePattern::Irregular
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    Pattern,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Forecast,
    ReconciledMatched,
}

/// One forecasted amount for one vendor group on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub client_id: String,
    pub vendor_group: String,
    pub date: NaiveDate,
    pub forecasted_amount: f64,
    pub pattern_type: Frequency,
    pub method: ForecastMethod,
    pub actual_amount: Option<f64>,
    pub variance: Option<f64>,
    pub is_locked: bool,
}

impl ForecastRecord {
    pub fn new(
        client_id: impl Into<String>,
        vendor_group: impl Into<String>,
        date: NaiveDate,
        forecasted_amount: f64,
        pattern_type: Frequency,
        method: ForecastMethod,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            vendor_group: vendor_group.into(),
            date,
            forecasted_amount,
            pattern_type,
            method,
            actual_amount: None,
            variance: None,
            is_locked: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            client_id: self.client_id.clone(),
            vendor_group: self.vendor_group.clone(),
            date: self.date,
        }
    }

    pub fn state(&self) -> RecordState {
        if self.is_locked {
            RecordState::ReconciledMatched
        } else {
            RecordState::Forecast
        }
    }

    /// The amount that counts towards cash balance: the actual once settled.
    pub fn effective_amount(&self) -> f64 {
        match (self.is_locked, self.actual_amount) {
            (true, Some(actual)) => actual,
            _ => self.forecasted_amount,
        }
    }

    /// Settles the record. Overwrites rather than accumulates, so repeating it is harmless.
    pub fn settle(&mut self, actual: f64) {
        self.actual_amount = Some(actual);
        self.variance = Some(actual - self.forecasted_amount);
        self.is_locked = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub client_id: String,
    pub vendor_group: String,
    pub date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_timing_descriptors() {
        assert_eq!(
            RecurrencePattern::Daily { weekdays_only: true }.timing_descriptor(),
            Some("weekdays".to_string())
        );
        assert_eq!(
            RecurrencePattern::Weekly {
                weekday: Weekday::Mon
            }
            .timing_descriptor(),
            Some("Monday".to_string())
        );
        assert_eq!(
            RecurrencePattern::Monthly {
                days: MonthlyDays::Twice(DayOfMonth::Day(15), DayOfMonth::Last)
            }
            .timing_descriptor(),
            Some("15th-and-last-day".to_string())
        );
        assert_eq!(
            RecurrencePattern::Annual {
                month: 3,
                day: DayOfMonth::Day(1)
            }
            .timing_descriptor(),
            Some("March 1st".to_string())
        );
        assert_eq!(RecurrencePattern::Irregular.timing_descriptor(), None);
    }

    #[test]
    fn test_day_of_month_clamps_short_months() {
        assert_eq!(DayOfMonth::Day(31).resolve(2025, 2), Some(d(2025, 2, 28)));
        assert_eq!(DayOfMonth::Day(30).resolve(2024, 2), Some(d(2024, 2, 29)));
        assert_eq!(DayOfMonth::Last.resolve(2025, 4), Some(d(2025, 4, 30)));
        assert!(DayOfMonth::Day(31).matches(d(2025, 6, 30)));
        assert!(!DayOfMonth::Day(31).matches(d(2025, 7, 30)));
    }

    #[test]
    fn test_days_from_wraps_month_boundary() {
        assert_eq!(DayOfMonth::Day(1).days_from(d(2025, 8, 31)), 1);
        assert_eq!(DayOfMonth::Last.days_from(d(2025, 10, 1)), 1);
        assert_eq!(DayOfMonth::Day(30).days_from(d(2025, 5, 30)), 0);
        assert_eq!(DayOfMonth::Day(30).days_from(d(2025, 5, 31)), 1);
        assert_eq!(DayOfMonth::Day(15).days_from(d(2025, 5, 13)), 2);
    }

    #[test]
    fn test_biweekly_parity() {
        let pattern = RecurrencePattern::Biweekly {
            weekday: Weekday::Mon,
            anchor: d(2025, 9, 15),
        };
        assert!(pattern.matches(d(2025, 9, 29)));
        assert!(!pattern.matches(d(2025, 9, 22)));
        assert!(pattern.matches(d(2025, 9, 1)));
    }

    #[test]
    fn test_quarterly_phase() {
        let pattern = RecurrencePattern::Quarterly {
            month: 1,
            day: DayOfMonth::Day(15),
        };
        assert!(pattern.matches(d(2025, 4, 15)));
        assert!(pattern.matches(d(2025, 10, 15)));
        assert!(!pattern.matches(d(2025, 5, 15)));
    }

    #[test]
    fn test_settle_is_overwrite() {
        let mut record = ForecastRecord::new(
            "acme",
            "Payroll",
            d(2025, 9, 15),
            -1000.0,
            Frequency::Biweekly,
            ForecastMethod::Pattern,
        );
        record.settle(-1100.0);
        record.settle(-1100.0);
        assert_eq!(record.actual_amount, Some(-1100.0));
        assert_eq!(record.variance, Some(-100.0));
        assert_eq!(record.state(), RecordState::ReconciledMatched);
        assert_eq!(record.effective_amount(), -1100.0);
    }

    #[test]
    fn test_pattern_serialization() {
        let pattern = RecurrencePattern::Biweekly {
            weekday: Weekday::Tue,
            anchor: d(2025, 8, 5),
        };
        let json = serde_json::to_string(&pattern).unwrap();
        assert!(json.contains("\"frequency\":\"biweekly\""));
        let back: RecurrencePattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }
}
