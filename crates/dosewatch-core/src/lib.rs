//! # Dosewatch Core Library
//!
//! This library provides the core logic for the dosewatch medication
//! adherence tracker. Every operation is available through the standalone
//! `dosewatch` CLI, which is a thin layer over this crate.
//!
//! ## Architecture
//!
//! - **Routines**: dosing schedules with supply tracking and pure state
//!   transitions (take, edit, refill)
//! - **Engine**: the operations callers run, with revision-checked writes
//! - **Reminders**: a polling loop that emits one reminder per due time
//! - **Storage**: SQLite persistence and TOML configuration
//! - **Accounts**: registration and password sign-in
//!
//! ## Key Components
//!
//! - [`ScheduleEngine`]: create, take, edit, refill, delete, dashboard
//! - [`NotificationPoller`]: background reminder loop
//! - [`Database`]: routine, ledger, and user persistence
//! - [`Config`]: application configuration management

pub mod accounts;
pub mod attachments;
pub mod clock;
pub mod engine;
pub mod error;
pub mod reminder;
pub mod routine;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use accounts::{AccountService, User};
pub use attachments::{AttachmentStore, FsAttachmentStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Dashboard, RoutineStatus, ScheduleEngine};
pub use error::{AccountError, ConfigError, CoreError, DatabaseError, ValidationError};
pub use reminder::{
    ConsoleSink, LogSink, MemorySink, NotificationPoller, Reminder, ReminderSink, TickReport,
};
pub use routine::{
    DoseEvent, DoseUnit, DueState, Routine, RoutineSpec, ScheduleRules, SupplyState,
    TreatmentStatus,
};
pub use storage::{Config, Database, RoutineStore};
