//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::routine::{DoseUnit, RoutineSpec};

/// 2025-03-01 08:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

/// One pill every eight hours from a box of three, starting at [`t0`].
pub fn sample_spec() -> RoutineSpec {
    RoutineSpec {
        patient_name: "Ana".into(),
        medication_name: "Amoxicillin".into(),
        dose_quantity: Decimal::ONE,
        unit: DoseUnit::Pill,
        total_quantity: Decimal::from(3),
        frequency_hours: 8,
        first_dose_time: t0(),
        treatment_end_date: None,
        instructions: None,
    }
}
