//! Schedule engine: the operations callers run against routines.
//!
//! The engine holds no state of its own. Each operation loads a routine
//! snapshot, applies a pure transition from [`crate::routine`], and writes
//! it back with a revision-checked update. When another writer got there
//! first the operation starts over from a fresh snapshot, so two
//! concurrent doses can never both draw on the same supply.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::attachments::AttachmentStore;
use crate::clock::Clock;
use crate::error::{CoreError, DatabaseError, Result};
use crate::routine::{
    DoseEvent, DueState, Routine, RoutineSpec, ScheduleRules, SupplyState, TreatmentStatus,
};
use crate::storage::RoutineStore;

/// Attempts before a conditional update gives up with [`CoreError::Conflict`].
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// A routine together with its classification at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RoutineStatus {
    #[serde(flatten)]
    pub routine: Routine,
    pub due_state: DueState,
    pub supply_state: SupplyState,
    pub low_supply: bool,
    pub doses_left: Decimal,
    pub minutes_until_due: i64,
    pub treatment: Option<TreatmentStatus>,
}

/// Times are kept at the store's millisecond precision so a returned
/// snapshot equals what a later read gives back.
fn stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// An owner's routines split by due state.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub generated_at: DateTime<Utc>,
    pub pending: Vec<RoutineStatus>,
    pub upcoming: Vec<RoutineStatus>,
    pub low_supply_count: usize,
}

pub struct ScheduleEngine {
    store: Arc<dyn RoutineStore>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    clock: Arc<dyn Clock>,
    rules: ScheduleRules,
}

impl ScheduleEngine {
    pub fn new(store: Arc<dyn RoutineStore>, clock: Arc<dyn Clock>, rules: ScheduleRules) -> Self {
        Self {
            store,
            attachments: None,
            clock,
            rules,
        }
    }

    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn rules(&self) -> &ScheduleRules {
        &self.rules
    }

    pub fn now(&self) -> DateTime<Utc> {
        stored_precision(self.clock.now())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_routine(&self, id: &str) -> Result<Routine> {
        self.store
            .get_routine(id)?
            .ok_or_else(|| CoreError::routine_not_found(id))
    }

    /// Like [`get_routine`](Self::get_routine), but another owner's routine
    /// is reported as missing.
    pub fn routine_for_owner(&self, owner_id: &str, id: &str) -> Result<Routine> {
        match self.store.get_routine(id)? {
            Some(routine) if routine.owner_id == owner_id => Ok(routine),
            _ => Err(CoreError::routine_not_found(id)),
        }
    }

    pub fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>> {
        Ok(self.store.list_routines(owner_id)?)
    }

    /// Ledger entries for a routine, oldest first, limited to doses
    /// `owner_id` took. Entries outlive the routine itself.
    ///
    /// Another owner's live routine is reported as missing, as is a routine
    /// with no remaining trace for this owner.
    pub fn history_for_owner(&self, owner_id: &str, routine_id: &str) -> Result<Vec<DoseEvent>> {
        let live = self.store.get_routine(routine_id)?;
        if matches!(&live, Some(routine) if routine.owner_id != owner_id) {
            return Err(CoreError::routine_not_found(routine_id));
        }
        let doses: Vec<_> = self
            .store
            .list_doses(routine_id)?
            .into_iter()
            .filter(|dose| dose.owner_id == owner_id)
            .collect();
        if doses.is_empty() && live.is_none() {
            return Err(CoreError::routine_not_found(routine_id));
        }
        Ok(doses)
    }

    pub fn status(&self, routine: Routine, now: DateTime<Utc>) -> RoutineStatus {
        RoutineStatus {
            due_state: routine.due_state(now, &self.rules),
            supply_state: routine.supply_state(&self.rules),
            low_supply: routine.is_low_supply(&self.rules),
            doses_left: routine.doses_left(),
            minutes_until_due: (routine.next_dose_time - now).num_minutes(),
            treatment: routine.treatment_status(now.date_naive()),
            routine,
        }
    }

    pub fn dashboard(&self, owner_id: &str) -> Result<Dashboard> {
        let now = self.now();
        let mut pending = Vec::new();
        let mut upcoming = Vec::new();
        for routine in self.store.list_routines(owner_id)? {
            let status = self.status(routine, now);
            match status.due_state {
                DueState::Pending => pending.push(status),
                DueState::Upcoming => upcoming.push(status),
            }
        }
        let low_supply_count = pending
            .iter()
            .chain(upcoming.iter())
            .filter(|s| s.low_supply)
            .count();
        Ok(Dashboard {
            generated_at: now,
            pending,
            upcoming,
            low_supply_count,
        })
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn create_routine(&self, owner_id: &str, mut spec: RoutineSpec) -> Result<Routine> {
        spec.first_dose_time = stored_precision(spec.first_dose_time);
        let routine = Routine::from_spec(
            Uuid::new_v4().to_string(),
            owner_id.to_string(),
            spec,
            self.now(),
        )?;
        self.store.insert_routine(&routine)?;
        tracing::info!(
            routine_id = %routine.id,
            medication = %routine.medication_name,
            next_dose = %routine.next_dose_time,
            "routine created"
        );
        Ok(routine)
    }

    /// Record a dose taken at `at`, deducting supply and moving the
    /// schedule to `at + frequency`.
    pub fn take_dose(&self, routine_id: &str, at: DateTime<Utc>) -> Result<(Routine, DoseEvent)> {
        let at = stored_precision(at);
        let (routine, event) = self.update_with_retry(
            routine_id,
            |routine| routine.take_dose(Uuid::new_v4().to_string(), at),
            |routine, event| self.store.record_dose(routine, event),
        )?;
        tracing::info!(
            routine_id,
            remaining = %routine.remaining_quantity,
            next_dose = %routine.next_dose_time,
            "dose taken"
        );
        Ok((routine, event))
    }

    pub fn edit_routine(&self, routine_id: &str, mut spec: RoutineSpec) -> Result<Routine> {
        spec.first_dose_time = stored_precision(spec.first_dose_time);
        let now = self.now();
        let (routine, ()) = self.update_with_retry(
            routine_id,
            |routine| Ok(routine.apply_edit(spec.clone(), now)?),
            |routine, _| self.store.replace_routine(routine),
        )?;
        tracing::info!(routine_id, next_dose = %routine.next_dose_time, "routine edited");
        Ok(routine)
    }

    pub fn refill_routine(&self, routine_id: &str) -> Result<Routine> {
        let now = self.now();
        let (routine, ()) = self.update_with_retry(
            routine_id,
            |routine| {
                routine.refill(now);
                Ok(())
            },
            |routine, _| self.store.replace_routine(routine),
        )?;
        tracing::info!(routine_id, remaining = %routine.remaining_quantity, "routine refilled");
        Ok(routine)
    }

    /// Delete a routine and its prescription image. Ledger entries stay.
    pub fn delete_routine(&self, routine_id: &str) -> Result<()> {
        let routine = self.get_routine(routine_id)?;
        if !self.store.delete_routine(routine_id)? {
            return Err(CoreError::routine_not_found(routine_id));
        }
        if let Some(name) = routine.prescription_image_ref.as_deref() {
            self.remove_attachment(name);
        }
        tracing::info!(routine_id, "routine deleted");
        Ok(())
    }

    /// Store a prescription image and link it to the routine, replacing
    /// any previous one.
    pub fn attach_prescription(
        &self,
        routine_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<Routine> {
        let attachments = self.attachment_store()?;
        // Fail fast on a missing routine before writing any file.
        self.get_routine(routine_id)?;
        let name = attachments.store(file_name, bytes)?;

        let now = self.now();
        let result = self.update_with_retry(
            routine_id,
            |routine| {
                routine.updated_at = now;
                Ok(routine.prescription_image_ref.replace(name.clone()))
            },
            |routine, _| self.store.replace_routine(routine),
        );
        match result {
            Ok((routine, previous)) => {
                if let Some(old) = previous.as_deref() {
                    self.remove_attachment(old);
                }
                tracing::info!(routine_id, attachment = %name, "prescription attached");
                Ok(routine)
            }
            Err(e) => {
                self.remove_attachment(&name);
                Err(e)
            }
        }
    }

    pub fn detach_prescription(&self, routine_id: &str) -> Result<Routine> {
        let now = self.now();
        let (routine, previous) = self.update_with_retry(
            routine_id,
            |routine| {
                routine.updated_at = now;
                Ok(routine.prescription_image_ref.take())
            },
            |routine, _| self.store.replace_routine(routine),
        )?;
        if let Some(old) = previous.as_deref() {
            self.remove_attachment(old);
        }
        Ok(routine)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn attachment_store(&self) -> Result<&Arc<dyn AttachmentStore>> {
        self.attachments
            .as_ref()
            .ok_or_else(|| CoreError::Custom("attachment storage is not configured".into()))
    }

    fn remove_attachment(&self, name: &str) {
        if let Some(attachments) = &self.attachments {
            if let Err(e) = attachments.delete(name) {
                tracing::warn!(attachment = %name, error = %e, "failed to delete attachment");
            }
        }
    }

    /// Read-modify-write loop over a conditional store update.
    ///
    /// `apply` runs against a fresh snapshot each attempt and may reject the
    /// change; `write` returns `false` when the snapshot went stale.
    fn update_with_retry<T>(
        &self,
        routine_id: &str,
        mut apply: impl FnMut(&mut Routine) -> Result<T>,
        write: impl Fn(&Routine, &T) -> Result<bool, DatabaseError>,
    ) -> Result<(Routine, T)> {
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let mut routine = self.get_routine(routine_id)?;
            let out = apply(&mut routine)?;
            if write(&routine, &out)? {
                routine.revision += 1;
                return Ok((routine, out));
            }
            tracing::debug!(routine_id, attempt, "routine changed during update, retrying");
        }
        Err(CoreError::Conflict {
            routine_id: routine_id.to_string(),
        })
    }
}
