//! Routine state transitions.
//!
//! Pure functions over a routine snapshot; no storage, no clock. The
//! engine loads a snapshot, applies one of these, and writes the result
//! back with a conditional update.
//!
//! ## Reminder state
//!
//! ```text
//! Unnotified -> (due window reached, reminder sent) -> Notified
//! Notified -> (dose taken | routine edited) -> Unnotified
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{DoseEvent, Routine, RoutineSpec};
use crate::error::{CoreError, ValidationError};

/// Dashboard grouping of a routine relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DueState {
    /// Due within the pending window, or overdue.
    Pending,
    Upcoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplyState {
    Ok,
    /// A refill will be needed soon.
    Low,
    /// Not enough left for one dose.
    Empty,
}

/// Where a routine stands against its treatment end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TreatmentStatus {
    Ongoing { ends_on: NaiveDate, days_left: i64 },
    EndsToday { ends_on: NaiveDate },
    Ended { ended_on: NaiveDate },
}

/// Thresholds used to classify routines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleRules {
    /// Routines due within this window count as pending.
    pub pending_window: Duration,
    /// Supply is low at or below this many doses.
    pub low_supply_doses: Decimal,
    /// How far ahead of the due time a reminder fires.
    pub reminder_lead: Duration,
}

impl Default for ScheduleRules {
    fn default() -> Self {
        Self {
            pending_window: Duration::minutes(30),
            low_supply_doses: Decimal::from(2),
            reminder_lead: Duration::minutes(10),
        }
    }
}

impl Routine {
    /// Build a new routine from a validated spec.
    pub fn from_spec(
        id: String,
        owner_id: String,
        spec: RoutineSpec,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        spec.validate()?;
        let instructions = spec.normalized_instructions();
        Ok(Self {
            id,
            owner_id,
            patient_name: spec.patient_name.trim().to_string(),
            medication_name: spec.medication_name.trim().to_string(),
            dose_quantity: spec.dose_quantity,
            unit: spec.unit,
            total_quantity: spec.total_quantity,
            remaining_quantity: spec.total_quantity,
            frequency_hours: spec.frequency_hours,
            first_dose_time: spec.first_dose_time,
            next_dose_time: spec.first_dose_time,
            last_dose_time: None,
            notified: false,
            treatment_end_date: spec.treatment_end_date,
            instructions,
            prescription_image_ref: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        })
    }

    pub fn frequency(&self) -> Duration {
        Duration::hours(i64::from(self.frequency_hours))
    }

    /// Quantity used since the last refill.
    pub fn consumed_quantity(&self) -> Decimal {
        self.total_quantity - self.remaining_quantity
    }

    /// Whole doses left before a refill is required.
    pub fn doses_left(&self) -> Decimal {
        self.remaining_quantity
            .checked_div(self.dose_quantity)
            .map(|d| d.floor())
            .unwrap_or(Decimal::MAX)
    }

    /// Deduct one dose taken at `at` and schedule the next one.
    ///
    /// Leaves the routine untouched when supply is short.
    pub fn take_dose(&mut self, event_id: String, at: DateTime<Utc>) -> Result<DoseEvent, CoreError> {
        if self.remaining_quantity < self.dose_quantity {
            return Err(CoreError::InsufficientSupply {
                routine_id: self.id.clone(),
                remaining: self.remaining_quantity,
                required: self.dose_quantity,
            });
        }
        let next = at.checked_add_signed(self.frequency()).ok_or_else(|| {
            ValidationError::invalid("frequency_hours", "next dose time is out of range")
        })?;
        self.remaining_quantity -= self.dose_quantity;
        self.last_dose_time = Some(at);
        self.next_dose_time = next;
        self.notified = false;
        self.updated_at = at;
        Ok(DoseEvent {
            id: event_id,
            routine_id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            taken_at: at,
            quantity: self.dose_quantity,
        })
    }

    /// Replace the routine's definition, keeping track of what was already
    /// consumed and restarting the schedule from the new first dose.
    pub fn apply_edit(&mut self, spec: RoutineSpec, now: DateTime<Utc>) -> Result<(), ValidationError> {
        spec.validate()?;
        let consumed = self.consumed_quantity();
        let instructions = spec.normalized_instructions();

        self.patient_name = spec.patient_name.trim().to_string();
        self.medication_name = spec.medication_name.trim().to_string();
        self.dose_quantity = spec.dose_quantity;
        self.unit = spec.unit;
        self.total_quantity = spec.total_quantity;
        self.remaining_quantity = (spec.total_quantity - consumed).max(Decimal::ZERO);
        self.frequency_hours = spec.frequency_hours;
        self.first_dose_time = spec.first_dose_time;
        self.next_dose_time = spec.first_dose_time;
        self.notified = false;
        self.treatment_end_date = spec.treatment_end_date;
        self.instructions = instructions;
        self.updated_at = now;
        Ok(())
    }

    /// Restore the full supply. The schedule is not touched.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        self.remaining_quantity = self.total_quantity;
        self.updated_at = now;
    }

    pub fn mark_notified(&mut self, now: DateTime<Utc>) {
        self.notified = true;
        self.updated_at = now;
    }

    pub fn due_state(&self, now: DateTime<Utc>, rules: &ScheduleRules) -> DueState {
        if self.next_dose_time <= now + rules.pending_window {
            DueState::Pending
        } else {
            DueState::Upcoming
        }
    }

    pub fn is_low_supply(&self, rules: &ScheduleRules) -> bool {
        // A threshold too large to represent cannot be reached.
        match rules.low_supply_doses.checked_mul(self.dose_quantity) {
            Some(threshold) => self.remaining_quantity <= threshold,
            None => false,
        }
    }

    pub fn supply_state(&self, rules: &ScheduleRules) -> SupplyState {
        if self.remaining_quantity < self.dose_quantity {
            SupplyState::Empty
        } else if self.is_low_supply(rules) {
            SupplyState::Low
        } else {
            SupplyState::Ok
        }
    }

    /// True when a reminder should be sent for the current due time.
    pub fn needs_reminder(&self, now: DateTime<Utc>, rules: &ScheduleRules) -> bool {
        !self.notified && self.next_dose_time <= now + rules.reminder_lead
    }

    pub fn treatment_status(&self, today: NaiveDate) -> Option<TreatmentStatus> {
        let ends_on = self.treatment_end_date?;
        let days_left = (ends_on - today).num_days();
        Some(match days_left {
            d if d > 0 => TreatmentStatus::Ongoing { ends_on, days_left: d },
            0 => TreatmentStatus::EndsToday { ends_on },
            _ => TreatmentStatus::Ended { ended_on: ends_on },
        })
    }
}
