//! Routine management commands for CLI.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Subcommand};
use dosewatch_core::routine::{parse_date, parse_dose_time, parse_quantity};
use dosewatch_core::{Config, DoseUnit, Routine, RoutineSpec};
use serde_json::json;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum RoutineAction {
    /// Create a routine
    Add {
        #[command(flatten)]
        fields: RoutineFields,
    },
    /// List routines with their current status
    List,
    /// Show one routine
    Show { id: String },
    /// Replace a routine's definition; omitted fields keep their values
    Edit {
        id: String,
        #[command(flatten)]
        fields: RoutineFields,
        /// Remove the treatment end date
        #[arg(long, conflicts_with = "ends")]
        no_end: bool,
        /// Remove the instructions
        #[arg(long, conflicts_with = "instructions")]
        clear_instructions: bool,
    },
    /// Delete a routine (its dose history is kept)
    Delete { id: String },
    /// Record a dose as taken
    Take {
        id: String,
        /// When the dose was taken (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Restore the full supply
    Refill { id: String },
    /// Show the dose history
    History { id: String },
    /// Attach a prescription image (png, jpg, jpeg, gif)
    Attach { id: String, file: PathBuf },
    /// Remove the prescription image
    Detach { id: String },
}

#[derive(Args)]
pub struct RoutineFields {
    /// Patient name
    #[arg(long)]
    patient: Option<String>,
    /// Medication name
    #[arg(long)]
    medication: Option<String>,
    /// Quantity per dose (e.g. 1, 2.5)
    #[arg(long)]
    dose: Option<String>,
    /// Dose unit: pill, ml, gram, other
    #[arg(long)]
    unit: Option<String>,
    /// Quantity in a full supply
    #[arg(long)]
    total: Option<String>,
    /// Hours between doses
    #[arg(long)]
    every: Option<u32>,
    /// First dose time (RFC 3339 or local "YYYY-MM-DD HH:MM")
    #[arg(long)]
    first: Option<String>,
    /// Last day of treatment (YYYY-MM-DD)
    #[arg(long)]
    ends: Option<String>,
    /// Administration notes
    #[arg(long)]
    instructions: Option<String>,
}

impl RoutineFields {
    fn required<T>(value: Option<T>, flag: &str) -> Result<T, Box<dyn std::error::Error>> {
        value.ok_or_else(|| format!("--{flag} is required").into())
    }

    fn ends(&self) -> Result<Option<NaiveDate>, Box<dyn std::error::Error>> {
        Ok(self
            .ends
            .as_deref()
            .map(|raw| parse_date("treatment_end_date", raw))
            .transpose()?)
    }

    fn into_spec(self) -> Result<RoutineSpec, Box<dyn std::error::Error>> {
        let treatment_end_date = self.ends()?;
        Ok(RoutineSpec {
            patient_name: Self::required(self.patient, "patient")?,
            medication_name: Self::required(self.medication, "medication")?,
            dose_quantity: parse_quantity("dose_quantity", &Self::required(self.dose, "dose")?)?,
            unit: match self.unit.as_deref() {
                Some(raw) => raw.parse()?,
                None => DoseUnit::Pill,
            },
            total_quantity: parse_quantity("total_quantity", &Self::required(self.total, "total")?)?,
            frequency_hours: Self::required(self.every, "every")?,
            first_dose_time: parse_dose_time("first_dose_time", &Self::required(self.first, "first")?)?,
            treatment_end_date,
            instructions: self.instructions,
        })
    }

    /// Overlay the given flags on an existing routine. The schedule restarts
    /// from `--first` when given, otherwise from the current next dose.
    fn merge_into_spec(
        self,
        current: &Routine,
        no_end: bool,
        clear_instructions: bool,
    ) -> Result<RoutineSpec, Box<dyn std::error::Error>> {
        let treatment_end_date = match self.ends()? {
            Some(date) => Some(date),
            None if no_end => None,
            None => current.treatment_end_date,
        };
        let instructions = match self.instructions {
            Some(text) => Some(text),
            None if clear_instructions => None,
            None => current.instructions.clone(),
        };
        Ok(RoutineSpec {
            patient_name: self.patient.unwrap_or_else(|| current.patient_name.clone()),
            medication_name: self
                .medication
                .unwrap_or_else(|| current.medication_name.clone()),
            dose_quantity: match self.dose.as_deref() {
                Some(raw) => parse_quantity("dose_quantity", raw)?,
                None => current.dose_quantity,
            },
            unit: match self.unit.as_deref() {
                Some(raw) => raw.parse()?,
                None => current.unit,
            },
            total_quantity: match self.total.as_deref() {
                Some(raw) => parse_quantity("total_quantity", raw)?,
                None => current.total_quantity,
            },
            frequency_hours: self.every.unwrap_or(current.frequency_hours),
            first_dose_time: match self.first.as_deref() {
                Some(raw) => parse_dose_time("first_dose_time", raw)?,
                None => current.next_dose_time,
            },
            treatment_end_date,
            instructions,
        })
    }
}

pub fn run(action: RoutineAction, config: Config) -> CliResult {
    let ctx = Context::open(config)?;
    let user = ctx.current_user()?;
    let engine = ctx.engine()?;

    match action {
        RoutineAction::Add { fields } => {
            let routine = engine.create_routine(&user.id, fields.into_spec()?)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
        RoutineAction::List => {
            let now = engine.now();
            let statuses: Vec<_> = engine
                .list_routines(&user.id)?
                .into_iter()
                .map(|routine| engine.status(routine, now))
                .collect();
            print_json(&statuses)?;
        }
        RoutineAction::Show { id } => {
            let routine = engine.routine_for_owner(&user.id, &id)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
        RoutineAction::Edit {
            id,
            fields,
            no_end,
            clear_instructions,
        } => {
            let current = engine.routine_for_owner(&user.id, &id)?;
            let spec = fields.merge_into_spec(&current, no_end, clear_instructions)?;
            let routine = engine.edit_routine(&id, spec)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
        RoutineAction::Delete { id } => {
            engine.routine_for_owner(&user.id, &id)?;
            engine.delete_routine(&id)?;
            print_json(&json!({ "id": id, "deleted": true }))?;
        }
        RoutineAction::Take { id, at } => {
            engine.routine_for_owner(&user.id, &id)?;
            let at = match at.as_deref() {
                Some(raw) => parse_dose_time("at", raw)?,
                None => engine.now(),
            };
            let (routine, dose) = engine.take_dose(&id, at)?;
            let status = engine.status(routine, engine.now());
            print_json(&json!({ "dose": dose, "routine": status }))?;
        }
        RoutineAction::Refill { id } => {
            engine.routine_for_owner(&user.id, &id)?;
            let routine = engine.refill_routine(&id)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
        RoutineAction::History { id } => {
            print_json(&engine.history_for_owner(&user.id, &id)?)?;
        }
        RoutineAction::Attach { id, file } => {
            engine.routine_for_owner(&user.id, &id)?;
            let bytes = std::fs::read(&file)
                .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| format!("{} has no file name", file.display()))?;
            let routine = engine.attach_prescription(&id, file_name, &bytes)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
        RoutineAction::Detach { id } => {
            engine.routine_for_owner(&user.id, &id)?;
            let routine = engine.detach_prescription(&id)?;
            print_json(&engine.status(routine, engine.now()))?;
        }
    }
    Ok(())
}
