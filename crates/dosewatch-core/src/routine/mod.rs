//! Dosing routines and the dose ledger records they produce.
//!
//! A [`Routine`] is a recurring medication schedule for one patient. The
//! state transitions (taking a dose, editing, refilling) live in
//! [`schedule`]; this module holds the types and input parsing.

mod schedule;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use schedule::{DueState, ScheduleRules, SupplyState, TreatmentStatus};

/// Unit a dose is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseUnit {
    Pill,
    Ml,
    Gram,
    Other,
}

impl DoseUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseUnit::Pill => "pill",
            DoseUnit::Ml => "ml",
            DoseUnit::Gram => "gram",
            DoseUnit::Other => "other",
        }
    }
}

impl FromStr for DoseUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pill" | "pills" | "tablet" | "capsule" => Ok(DoseUnit::Pill),
            "ml" | "milliliter" | "millilitre" => Ok(DoseUnit::Ml),
            "g" | "gram" | "grams" => Ok(DoseUnit::Gram),
            "other" => Ok(DoseUnit::Other),
            other => Err(ValidationError::invalid(
                "unit",
                format!("unknown unit '{other}' (expected pill, ml, gram or other)"),
            )),
        }
    }
}

impl fmt::Display for DoseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest supported interval between doses: one year.
pub const MAX_FREQUENCY_HOURS: u32 = 24 * 366;

/// Largest accepted dose or supply quantity, in the routine's unit.
pub const MAX_QUANTITY: u32 = 1_000_000;

/// Caller-supplied fields for creating or editing a routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineSpec {
    pub patient_name: String,
    pub medication_name: String,
    pub dose_quantity: Decimal,
    pub unit: DoseUnit,
    pub total_quantity: Decimal,
    pub frequency_hours: u32,
    pub first_dose_time: DateTime<Utc>,
    #[serde(default)]
    pub treatment_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl RoutineSpec {
    /// Check required fields and numeric ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.patient_name.trim().is_empty() {
            return Err(ValidationError::MissingField("patient_name"));
        }
        if self.medication_name.trim().is_empty() {
            return Err(ValidationError::MissingField("medication_name"));
        }
        if self.frequency_hours == 0 {
            return Err(ValidationError::invalid(
                "frequency_hours",
                "must be a positive number of hours",
            ));
        }
        if self.frequency_hours > MAX_FREQUENCY_HOURS {
            return Err(ValidationError::invalid(
                "frequency_hours",
                format!("must be at most {MAX_FREQUENCY_HOURS} hours"),
            ));
        }
        if self.dose_quantity <= Decimal::ZERO {
            return Err(ValidationError::invalid(
                "dose_quantity",
                "must be greater than zero",
            ));
        }
        let max = Decimal::from(MAX_QUANTITY);
        if self.dose_quantity > max {
            return Err(ValidationError::invalid(
                "dose_quantity",
                format!("must be at most {MAX_QUANTITY}"),
            ));
        }
        if self.total_quantity > max {
            return Err(ValidationError::invalid(
                "total_quantity",
                format!("must be at most {MAX_QUANTITY}"),
            ));
        }
        if self.total_quantity < self.dose_quantity {
            return Err(ValidationError::QuantityOrder {
                total: self.total_quantity,
                dose: self.dose_quantity,
            });
        }
        Ok(())
    }

    /// Blank instructions are stored as absent.
    pub(crate) fn normalized_instructions(&self) -> Option<String> {
        self.instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// A recurring medication schedule for one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    pub owner_id: String,
    pub patient_name: String,
    pub medication_name: String,
    pub dose_quantity: Decimal,
    pub unit: DoseUnit,
    pub total_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub frequency_hours: u32,
    pub first_dose_time: DateTime<Utc>,
    pub next_dose_time: DateTime<Utc>,
    pub last_dose_time: Option<DateTime<Utc>>,
    /// A reminder already fired for the current `next_dose_time`.
    pub notified: bool,
    pub treatment_end_date: Option<NaiveDate>,
    pub instructions: Option<String>,
    pub prescription_image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Write counter; every stored update is conditional on it.
    pub revision: u64,
}

/// An administered dose. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseEvent {
    pub id: String,
    pub routine_id: String,
    /// Owner of the routine when the dose was taken; kept so the ledger
    /// stays private after the routine is deleted.
    pub owner_id: String,
    pub taken_at: DateTime<Utc>,
    pub quantity: Decimal,
}

/// Parse a decimal quantity from user input.
pub fn parse_quantity(field: &str, raw: &str) -> Result<Decimal, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::invalid(field, "value is empty"));
    }
    Decimal::from_str(trimmed)
        .map_err(|e| ValidationError::invalid(field, format!("'{trimmed}' is not a number: {e}")))
}

/// Parse a dose time.
///
/// Accepts RFC 3339 (`2025-03-01T08:00:00Z`) or the HTML
/// `datetime-local` form (`2025-03-01T08:00`), which is read in local time.
pub fn parse_dose_time(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M"))
        .map_err(|_| {
            ValidationError::invalid(field, format!("'{trimmed}' is not a date-time"))
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::invalid(field, format!("'{trimmed}' does not exist locally")))
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::invalid(field, format!("'{}' is not a YYYY-MM-DD date", raw.trim())))
}
