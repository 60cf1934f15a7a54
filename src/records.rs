//! Billing-line input facts and the validation that turns raw text rows into them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_BILLING_YEAR, MAX_ROW_AMOUNT_CENTS, MAX_ROW_COUNT, MIN_BILLING_YEAR};
use crate::error::{IngestError, MalformedRecordError, RejectReason};

pub const UNKNOWN_SPECIALTY: &str = "Unknown";
pub const UNKNOWN_STATE: &str = "XX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Individual,
    Organization,
}

impl EntityType {
    /// Accepts NPPES enumeration codes (`1`/`NPI-1`, `2`/`NPI-2`) as well as the names.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "i" | "npi-1" | "individual" => Some(EntityType::Individual),
            "2" | "o" | "npi-2" | "organization" | "organisation" => Some(EntityType::Organization),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Individual => "individual",
            EntityType::Organization => "organization",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider x procedure code x year row. Amounts are whole cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingLineRecord {
    pub provider_id: String,
    pub year: u16,
    pub procedure_code: String,
    pub service_count: u64,
    pub beneficiary_count: u64,
    pub submitted_charge_cents: u64,
    pub allowed_amount_cents: u64,
    pub paid_amount_cents: u64,
    pub specialty: String,
    pub state: String,
    pub entity_type: Option<EntityType>,
}

/// A billing row exactly as read from the extract, every column as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBillingRow {
    pub provider_id: Option<String>,
    pub year: Option<String>,
    pub procedure_code: Option<String>,
    pub service_count: Option<String>,
    pub beneficiary_count: Option<String>,
    pub submitted_charge_total: Option<String>,
    pub allowed_amount_total: Option<String>,
    pub paid_amount_total: Option<String>,
    pub specialty: Option<String>,
    pub state: Option<String>,
    pub entity_type: Option<String>,
}

impl RawBillingRow {
    pub fn parse(&self) -> Result<BillingLineRecord, MalformedRecordError> {
        let provider_id =
            non_blank(self.provider_id.as_deref()).ok_or_else(|| MalformedRecordError {
                field: "provider_id",
                value: self.provider_id.clone().unwrap_or_default(),
                reason: RejectReason::MissingProviderId,
            })?;
        let procedure_code = non_blank(self.procedure_code.as_deref())
            .map(|code| code.to_ascii_uppercase())
            .ok_or_else(|| MalformedRecordError {
                field: "procedure_code",
                value: self.procedure_code.clone().unwrap_or_default(),
                reason: RejectReason::MissingProcedureCode,
            })?;

        let year = parse_year(self.year.as_deref())?;
        let service_count = parse_count("service_count", self.service_count.as_deref())?;
        let beneficiary_count =
            parse_count("beneficiary_count", self.beneficiary_count.as_deref())?;
        let submitted_charge_cents =
            parse_cents("submitted_charge_total", self.submitted_charge_total.as_deref())?;
        let allowed_amount_cents =
            parse_cents("allowed_amount_total", self.allowed_amount_total.as_deref())?;
        let paid_amount_cents =
            parse_cents("paid_amount_total", self.paid_amount_total.as_deref())?;

        let specialty = non_blank(self.specialty.as_deref())
            .unwrap_or(UNKNOWN_SPECIALTY)
            .to_string();
        let state = non_blank(self.state.as_deref())
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_else(|| UNKNOWN_STATE.to_string());
        let entity_type = self.entity_type.as_deref().and_then(EntityType::parse);

        Ok(BillingLineRecord {
            provider_id: provider_id.to_string(),
            year,
            procedure_code,
            service_count,
            beneficiary_count,
            submitted_charge_cents,
            allowed_amount_cents,
            paid_amount_cents,
            specialty,
            state,
            entity_type,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Outcome of reading an integral field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Whole {
    Value(u64),
    Negative,
    TooLarge,
    Invalid,
}

/// Integral value; tolerates a `.0` suffix from float-typed columns.
fn parse_whole(raw: &str) -> Whole {
    if let Ok(v) = raw.parse::<u64>() {
        return Whole::Value(v);
    }
    if let Ok(v) = raw.parse::<i64>() {
        return if v < 0 { Whole::Negative } else { Whole::Invalid };
    }
    let Ok(v) = raw.parse::<f64>() else {
        return Whole::Invalid;
    };
    if !v.is_finite() || v.fract() != 0.0 {
        Whole::Invalid
    } else if v < 0.0 {
        Whole::Negative
    } else if v >= u64::MAX as f64 {
        Whole::TooLarge
    } else {
        Whole::Value(v as u64)
    }
}

fn parse_count(field: &'static str, raw: Option<&str>) -> Result<u64, MalformedRecordError> {
    let value = raw.map(str::trim).unwrap_or_default();
    let reason = match parse_whole(value) {
        Whole::Value(v) if v <= MAX_ROW_COUNT => return Ok(v),
        Whole::Value(_) | Whole::TooLarge => RejectReason::CountOutOfRange,
        Whole::Negative => RejectReason::NegativeCount,
        Whole::Invalid => RejectReason::NonNumericCount,
    };
    Err(MalformedRecordError {
        field,
        value: value.to_string(),
        reason,
    })
}

fn parse_year(raw: Option<&str>) -> Result<u16, MalformedRecordError> {
    let value = raw.map(str::trim).unwrap_or_default();
    let years = u64::from(MIN_BILLING_YEAR)..=u64::from(MAX_BILLING_YEAR);
    match parse_whole(value) {
        Whole::Value(v) if years.contains(&v) => Ok(v as u16),
        _ => Err(MalformedRecordError {
            field: "year",
            value: value.to_string(),
            reason: RejectReason::InvalidYear,
        }),
    }
}

/// Parses a dollar amount into whole cents. `$` and thousands separators are accepted.
///
/// Amounts above [`MAX_ROW_AMOUNT_CENTS`] are rejected rather than saturated.
pub fn parse_cents(field: &'static str, raw: Option<&str>) -> Result<u64, MalformedRecordError> {
    let value = raw.map(str::trim).unwrap_or_default();
    let cleaned: String = value
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let reject = |reason| MalformedRecordError {
        field,
        value: value.to_string(),
        reason,
    };
    let Some(dollars) = cleaned.parse::<f64>().ok().filter(|v| v.is_finite()) else {
        return Err(reject(RejectReason::NonNumericAmount));
    };
    if dollars < 0.0 {
        return Err(reject(RejectReason::NegativeAmount));
    }
    let cents = (dollars * 100.0).round();
    if cents > MAX_ROW_AMOUNT_CENTS as f64 {
        return Err(reject(RejectReason::AmountOutOfRange));
    }
    Ok(cents as u64)
}

pub fn cents_to_dollars(cents: u64) -> f64 {
    cents as f64 / 100.0
}

/// Running count of accepted and rejected billing rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestTally {
    pub rows_read: u64,
    pub rows_accepted: u64,
    pub rows_rejected: u64,
    pub rejected_by_reason: BTreeMap<RejectReason, u64>,
    #[serde(skip)]
    pub first_rejection: Option<(u64, MalformedRecordError)>,
}

impl IngestTally {
    /// Records the outcome of parsing row `row_number` (1-based) and passes accepted rows through.
    pub fn observe(
        &mut self,
        row_number: u64,
        parsed: Result<BillingLineRecord, MalformedRecordError>,
    ) -> Option<BillingLineRecord> {
        self.rows_read += 1;
        match parsed {
            Ok(record) => {
                self.rows_accepted += 1;
                Some(record)
            }
            Err(err) => {
                self.rows_rejected += 1;
                *self.rejected_by_reason.entry(err.reason).or_default() += 1;
                if self.first_rejection.is_none() {
                    self.first_rejection = Some((row_number, err));
                }
                None
            }
        }
    }

    pub fn rejection_rate(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.rows_rejected as f64 / self.rows_read as f64
        }
    }

    /// Fails when the rejected share suggests wholesale input corruption.
    pub fn check_ceiling(&self, ceiling: f64) -> Result<(), IngestError> {
        if self.rows_accepted == 0 {
            return Err(IngestError::NoValidRows {
                total: self.rows_read,
            });
        }
        let rate = self.rejection_rate();
        if rate <= ceiling {
            return Ok(());
        }
        let (first_row, first_error) = self.first_rejection.clone().unwrap_or((
            0,
            MalformedRecordError {
                field: "unknown",
                value: String::new(),
                reason: RejectReason::NonNumericAmount,
            },
        ));
        Err(IngestError::RejectionCeiling {
            rejected: self.rows_rejected,
            total: self.rows_read,
            rate,
            ceiling,
            first_row,
            first_error,
        })
    }
}
