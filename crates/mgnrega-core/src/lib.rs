//! Core domain model for the MGNREGA district dataset: raw upstream records,
//! the canonical record they normalize into, and the reconciliation key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "mgnrega-core";

/// Upstream field names as published by the data.gov.in resource.
pub mod fields {
    pub const FIN_YEAR: &str = "fin_year";
    pub const MONTH: &str = "month";
    pub const STATE_CODE: &str = "state_code";
    pub const STATE_NAME: &str = "state_name";
    pub const DISTRICT_CODE: &str = "district_code";
    pub const DISTRICT_NAME: &str = "district_name";
    pub const APPROVED_LABOUR_BUDGET: &str = "Approved_Labour_Budget";
    pub const AVERAGE_WAGE_RATE: &str = "Average_Wage_rate_per_day_per_person";
    pub const TOTAL_HOUSEHOLDS_WORKED: &str = "Total_Households_Worked";
    pub const TOTAL_INDIVIDUALS_WORKED: &str = "Total_Individuals_Worked";
}

/// Untrusted record as returned by the upstream API. Any field may be absent,
/// null, or of an unexpected type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value when it is an object; anything else is not a record.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact lookup first, then ASCII case-insensitive, so `Approved_Labour_Budget`
    /// and `approved_labour_budget` resolve to the same field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).or_else(|| {
            self.0
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(field))
                .map(|(_, value)| value)
        })
    }

    /// Text value of a field, or an empty string when absent or null.
    pub fn text_or_default(&self, field: &str) -> String {
        match self.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Whole-number measure; unparsable, non-finite or negative input yields 0.
    pub fn count_or_zero(&self, field: &str) -> i64 {
        let parsed = match self.get(field) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_finite)),
            Some(Value::String(s)) => parse_whole_number(s),
            _ => None,
        };
        parsed.filter(|v| *v > 0).unwrap_or(0)
    }

    /// Decimal measure parsed from the leading numeric prefix of the value;
    /// unparsable, non-finite or negative input yields 0.
    pub fn decimal_or_zero(&self, field: &str) -> f64 {
        let parsed = match self.get(field) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => leading_decimal(s),
            _ => None,
        };
        parsed
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0)
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn truncate_finite(value: f64) -> Option<i64> {
    // `as` saturates at the i64 bounds.
    value.is_finite().then(|| value.trunc() as i64)
}

fn parse_whole_number(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(v);
    }
    trimmed.parse::<f64>().ok().and_then(truncate_finite)
}

/// Parses the longest decimal prefix (`"231.5 Rs"` -> 231.5, `"abc"` -> None).
fn leading_decimal(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }
    s[..end].parse::<f64>().ok()
}

/// Normalized, fully-typed district-month record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub fin_year: String,
    pub month: String,
    pub state_code: String,
    pub state_name: String,
    pub district_code: String,
    pub district_name: String,
    pub approved_labour_budget: i64,
    pub average_wage_rate_per_day_per_person: f64,
    pub total_households_worked: i64,
    pub total_individuals_worked: i64,
}

impl CanonicalRecord {
    pub fn key(&self) -> ReconciliationKey {
        key_of(self)
    }
}

/// Natural key identifying the same logical record across fetch cycles.
/// Display names are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconciliationKey {
    pub fin_year: String,
    pub month: String,
    pub state_code: String,
    pub district_code: String,
}

pub fn key_of(record: &CanonicalRecord) -> ReconciliationKey {
    ReconciliationKey {
        fin_year: record.fin_year.clone(),
        month: record.month.clone(),
        state_code: record.state_code.clone(),
        district_code: record.district_code.clone(),
    }
}

/// Total conversion from an upstream record. Malformed fields become empty
/// strings or zero; nothing is rejected.
pub fn normalize(raw: &RawRecord) -> CanonicalRecord {
    CanonicalRecord {
        fin_year: raw.text_or_default(fields::FIN_YEAR),
        month: raw.text_or_default(fields::MONTH),
        state_code: raw.text_or_default(fields::STATE_CODE),
        state_name: raw.text_or_default(fields::STATE_NAME),
        district_code: raw.text_or_default(fields::DISTRICT_CODE),
        district_name: raw.text_or_default(fields::DISTRICT_NAME),
        approved_labour_budget: raw.count_or_zero(fields::APPROVED_LABOUR_BUDGET),
        average_wage_rate_per_day_per_person: raw.decimal_or_zero(fields::AVERAGE_WAGE_RATE),
        total_households_worked: raw.count_or_zero(fields::TOTAL_HOUSEHOLDS_WORKED),
        total_individuals_worked: raw.count_or_zero(fields::TOTAL_INDIVIDUALS_WORKED),
    }
}

/// Persisted row: surrogate id plus the canonical columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: CanonicalRecord,
}

/// Read-side filter. Name filters are case-insensitive substrings, `fin_year`
/// is exact; blank values impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub state_name: Option<String>,
    pub fin_year: Option<String>,
    pub district_name: Option<String>,
}

impl RecordFilter {
    pub fn state_name(&self) -> Option<&str> {
        non_blank(&self.state_name)
    }

    pub fn fin_year(&self) -> Option<&str> {
        non_blank(&self.fin_year)
    }

    pub fn district_name(&self) -> Option<&str> {
        non_blank(&self.district_name)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.state_name().is_none() && self.fin_year().is_none() && self.district_name().is_none()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Dashboard headline figures over a set of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub rows: usize,
    pub total_approved_labour_budget: i64,
    pub average_wage_rate_per_day_per_person: f64,
    pub total_households_worked: i64,
    pub total_individuals_worked: i64,
}

pub fn summarize<'a>(records: impl IntoIterator<Item = &'a CanonicalRecord>) -> RecordSummary {
    let mut summary = RecordSummary::default();
    let mut wage_sum = 0.0;
    for record in records {
        summary.rows += 1;
        summary.total_approved_labour_budget = summary
            .total_approved_labour_budget
            .saturating_add(record.approved_labour_budget);
        summary.total_households_worked = summary
            .total_households_worked
            .saturating_add(record.total_households_worked);
        summary.total_individuals_worked = summary
            .total_individuals_worked
            .saturating_add(record.total_individuals_worked);
        wage_sum += record.average_wage_rate_per_day_per_person;
    }
    if summary.rows > 0 {
        summary.average_wage_rate_per_day_per_person = wage_sum / summary.rows as f64;
    }
    summary
}
