//! Dose reminders and where they are delivered.

mod poller;

pub use poller::{NotificationPoller, TickReport};

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::Result;
use crate::routine::{DoseUnit, Routine, TreatmentStatus};

/// A reminder for one upcoming (or overdue) dose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reminder {
    pub routine_id: String,
    pub owner_id: String,
    pub patient_name: String,
    pub medication_name: String,
    pub due_at: DateTime<Utc>,
    /// Whole minutes until `due_at`, truncated toward zero.
    pub minutes_until_due: i64,
    pub dose_quantity: Decimal,
    pub unit: DoseUnit,
    pub instructions: Option<String>,
    pub treatment: Option<TreatmentStatus>,
    pub generated_at: DateTime<Utc>,
}

impl Reminder {
    pub fn for_routine(routine: &Routine, now: DateTime<Utc>) -> Self {
        Self {
            routine_id: routine.id.clone(),
            owner_id: routine.owner_id.clone(),
            patient_name: routine.patient_name.clone(),
            medication_name: routine.medication_name.clone(),
            due_at: routine.next_dose_time,
            minutes_until_due: (routine.next_dose_time - now).num_seconds() / 60,
            dose_quantity: routine.dose_quantity,
            unit: routine.unit,
            instructions: routine.instructions.clone(),
            treatment: routine.treatment_status(now.date_naive()),
            generated_at: now,
        }
    }

    pub fn is_due_now(&self) -> bool {
        self.minutes_until_due <= 0
    }

    /// "due in ~N minutes" or "due now".
    pub fn timing(&self) -> String {
        if self.is_due_now() {
            "due now".to_string()
        } else {
            format!("due in ~{} minutes", self.minutes_until_due)
        }
    }
}

impl fmt::Display for Reminder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {} ({})",
            self.patient_name,
            self.medication_name,
            self.dose_quantity.normalize(),
            self.unit,
            self.timing()
        )?;
        if let Some(instructions) = &self.instructions {
            write!(f, " - {instructions}")?;
        }
        match self.treatment {
            Some(TreatmentStatus::Ongoing { ends_on, .. }) => {
                write!(f, " [treatment ends {ends_on}]")?
            }
            Some(TreatmentStatus::EndsToday { .. }) => write!(f, " [last day of treatment]")?,
            Some(TreatmentStatus::Ended { ended_on }) => {
                write!(f, " [treatment ended {ended_on}]")?
            }
            None => {}
        }
        Ok(())
    }
}

/// Destination for reminders.
///
/// A delivery that returns `Err` leaves the routine unmarked, so the next
/// poll tries again.
pub trait ReminderSink: Send + Sync {
    fn deliver(&self, reminder: &Reminder) -> Result<()>;
}

/// Writes reminders to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReminderSink for LogSink {
    fn deliver(&self, reminder: &Reminder) -> Result<()> {
        tracing::info!(
            routine_id = %reminder.routine_id,
            patient = %reminder.patient_name,
            medication = %reminder.medication_name,
            due_at = %reminder.due_at,
            minutes_until_due = reminder.minutes_until_due,
            "reminder: {}",
            reminder.timing()
        );
        Ok(())
    }
}

/// Prints one line per reminder to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ReminderSink for ConsoleSink {
    fn deliver(&self, reminder: &Reminder) -> Result<()> {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{reminder}")?;
        out.flush()?;
        Ok(())
    }
}

/// Collects reminders in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Reminder>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    pub fn reminders(&self) -> Vec<Reminder> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain delivered reminders.
    pub fn take(&self) -> Vec<Reminder> {
        std::mem::take(&mut *self.delivered.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ReminderSink for MemorySink {
    fn deliver(&self, reminder: &Reminder) -> Result<()> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reminder.clone());
        Ok(())
    }
}
