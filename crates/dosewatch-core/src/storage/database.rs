//! SQLite storage for users, routines, and the dose ledger.
//!
//! Provides persistent storage for:
//! - User accounts
//! - Dosing routines (conditional, revision-checked updates)
//! - Taken doses (append-only)
//! - Key-value store for CLI state such as the signed-in user

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::{data_dir, migrations, RoutineStore};
use crate::accounts::User;
use crate::error::{CoreError, DatabaseError};
use crate::routine::{DoseEvent, DoseUnit, Routine};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ROUTINE_COLUMNS: &str = "id, owner_id, patient_name, medication_name, dose_quantity, unit,
     total_quantity, remaining_quantity, frequency_hours, first_dose_time, next_dose_time,
     last_dose_time, notified, treatment_end_date, instructions, prescription_image_ref,
     created_at, updated_at, revision";

/// Timestamps are stored as fixed-width RFC 3339 so that text comparison
/// in SQL matches time order.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_date_col(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

/// Build a Routine from a row selected with [`ROUTINE_COLUMNS`].
fn row_to_routine(row: &Row) -> rusqlite::Result<Routine> {
    let unit_str: String = row.get(5)?;
    let unit = DoseUnit::from_str(&unit_str).map_err(|e| conversion_error(5, e))?;
    Ok(Routine {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        patient_name: row.get(2)?,
        medication_name: row.get(3)?,
        dose_quantity: decimal_col(row, 4)?,
        unit,
        total_quantity: decimal_col(row, 6)?,
        remaining_quantity: decimal_col(row, 7)?,
        frequency_hours: row.get(8)?,
        first_dose_time: time_col(row, 9)?,
        next_dose_time: time_col(row, 10)?,
        last_dose_time: opt_time_col(row, 11)?,
        notified: row.get(12)?,
        treatment_end_date: opt_date_col(row, 13)?,
        instructions: row.get(14)?,
        prescription_image_ref: row.get(15)?,
        created_at: time_col(row, 16)?,
        updated_at: time_col(row, 17)?,
        revision: row.get::<_, i64>(18)? as u64,
    })
}

fn row_to_dose(row: &Row) -> rusqlite::Result<DoseEvent> {
    Ok(DoseEvent {
        id: row.get(0)?,
        routine_id: row.get(1)?,
        owner_id: row.get(2)?,
        taken_at: time_col(row, 3)?,
        quantity: decimal_col(row, 4)?,
    })
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: time_col(row, 4)?,
    })
}

/// Conditional overwrite shared by `replace_routine` and `record_dose`.
fn update_routine_if_current(conn: &Connection, routine: &Routine) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE routines SET
            patient_name = ?3, medication_name = ?4, dose_quantity = ?5, unit = ?6,
            total_quantity = ?7, remaining_quantity = ?8, frequency_hours = ?9,
            first_dose_time = ?10, next_dose_time = ?11, last_dose_time = ?12,
            notified = ?13, treatment_end_date = ?14, instructions = ?15,
            prescription_image_ref = ?16, updated_at = ?17, revision = revision + 1
         WHERE id = ?1 AND revision = ?2",
        params![
            routine.id,
            routine.revision as i64,
            routine.patient_name,
            routine.medication_name,
            routine.dose_quantity.to_string(),
            routine.unit.as_str(),
            routine.total_quantity.to_string(),
            routine.remaining_quantity.to_string(),
            routine.frequency_hours,
            format_time(routine.first_dose_time),
            format_time(routine.next_dose_time),
            routine.last_dose_time.map(format_time),
            routine.notified,
            routine.treatment_end_date.map(|d| d.format("%Y-%m-%d").to_string()),
            routine.instructions,
            routine.prescription_image_ref,
            format_time(routine.updated_at),
        ],
    )?;
    Ok(changed == 1)
}

/// SQLite database.
///
/// The connection sits behind a mutex so one handle can be shared between
/// request handling and the reminder poller.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `<data dir>/dosewatch.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, CoreError> {
        let path = data_dir()?.join("dosewatch.db");
        Ok(Self::open_at(&path)?)
    }

    /// Open the database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for tests).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn();
        // Base (v1) schema; later columns arrive through migrations.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                email         TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routines (
                id                 TEXT PRIMARY KEY,
                owner_id           TEXT NOT NULL,
                patient_name       TEXT NOT NULL,
                medication_name    TEXT NOT NULL,
                dose_quantity      TEXT NOT NULL,
                unit               TEXT NOT NULL DEFAULT 'pill',
                total_quantity     TEXT NOT NULL,
                remaining_quantity TEXT NOT NULL,
                frequency_hours    INTEGER NOT NULL,
                first_dose_time    TEXT NOT NULL,
                next_dose_time     TEXT NOT NULL,
                last_dose_time     TEXT,
                notified           INTEGER NOT NULL DEFAULT 0,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL,
                revision           INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS doses (
                id         TEXT PRIMARY KEY,
                routine_id TEXT NOT NULL,
                taken_at   TEXT NOT NULL,
                quantity   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_routines_owner ON routines(owner_id);
            CREATE INDEX IF NOT EXISTS idx_doses_routine_taken_at ON doses(routine_id, taken_at);",
        )?;

        migrations::migrate(&conn)?;
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Insert a user. Returns `false` if the email is already taken.
    pub fn insert_user(&self, user: &User) -> Result<bool, DatabaseError> {
        let result = self.conn().execute(
            "INSERT INTO users (id, name, email, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.name,
                user.email,
                user.password_hash,
                format_time(user.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                "SELECT id, name, email, password_hash, created_at FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Case-insensitive lookup by email.
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                "SELECT id, name, email, password_hash, created_at FROM users WHERE email = ?1",
                params![email],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn update_password_hash(&self, user_id: &str, hash: &str) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE users SET password_hash = ?2 WHERE id = ?1",
            params![user_id, hash],
        )?;
        Ok(changed == 1)
    }

    // ── Key-value ────────────────────────────────────────────────────

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl RoutineStore for Database {
    fn insert_routine(&self, routine: &Routine) -> Result<(), DatabaseError> {
        self.conn().execute(
            &format!(
                "INSERT INTO routines ({ROUTINE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                routine.id,
                routine.owner_id,
                routine.patient_name,
                routine.medication_name,
                routine.dose_quantity.to_string(),
                routine.unit.as_str(),
                routine.total_quantity.to_string(),
                routine.remaining_quantity.to_string(),
                routine.frequency_hours,
                format_time(routine.first_dose_time),
                format_time(routine.next_dose_time),
                routine.last_dose_time.map(format_time),
                routine.notified,
                routine.treatment_end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                routine.instructions,
                routine.prescription_image_ref,
                format_time(routine.created_at),
                format_time(routine.updated_at),
                routine.revision as i64,
            ],
        )?;
        Ok(())
    }

    fn get_routine(&self, id: &str) -> Result<Option<Routine>, DatabaseError> {
        let conn = self.conn();
        let routine = conn
            .query_row(
                &format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE id = ?1"),
                params![id],
                row_to_routine,
            )
            .optional()?;
        Ok(routine)
    }

    fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTINE_COLUMNS} FROM routines
             WHERE owner_id = ?1
             ORDER BY next_dose_time ASC"
        ))?;
        let rows = stmt.query_map(params![owner_id], row_to_routine)?;
        let routines = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(routines)
    }

    fn list_reminder_candidates(
        &self,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Routine>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTINE_COLUMNS} FROM routines
             WHERE notified = 0 AND next_dose_time <= ?1
             ORDER BY next_dose_time ASC"
        ))?;
        let rows = stmt.query_map(params![format_time(due_before)], row_to_routine)?;
        let routines = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(routines)
    }

    fn replace_routine(&self, routine: &Routine) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        Ok(update_routine_if_current(&conn, routine)?)
    }

    fn record_dose(&self, routine: &Routine, event: &DoseEvent) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        if !update_routine_if_current(&tx, routine)? {
            // Dropping the transaction rolls it back.
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO doses (id, routine_id, owner_id, taken_at, quantity)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.routine_id,
                event.owner_id,
                format_time(event.taken_at),
                event.quantity.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn mark_notified(
        &self,
        id: &str,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE routines SET notified = 1, updated_at = ?3, revision = revision + 1
             WHERE id = ?1 AND revision = ?2 AND notified = 0",
            params![id, expected_revision as i64, format_time(at)],
        )?;
        Ok(changed == 1)
    }

    fn delete_routine(&self, id: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM routines WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    fn list_doses(&self, routine_id: &str) -> Result<Vec<DoseEvent>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, routine_id, owner_id, taken_at, quantity FROM doses
             WHERE routine_id = ?1
             ORDER BY taken_at ASC",
        )?;
        let rows = stmt.query_map(params![routine_id], row_to_dose)?;
        let doses = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(doses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_spec, t0};
    use chrono::Duration;

    fn stored_routine(db: &Database) -> Routine {
        let routine = Routine::from_spec("r1".into(), "u1".into(), sample_spec(), t0()).unwrap();
        db.insert_routine(&routine).unwrap();
        routine
    }

    #[test]
    fn routine_roundtrips_through_sqlite() {
        let db = Database::open_memory().unwrap();
        let mut spec = sample_spec();
        spec.dose_quantity = Decimal::new(25, 1);
        spec.total_quantity = Decimal::new(1005, 1);
        spec.instructions = Some("after meals".into());
        spec.treatment_end_date = NaiveDate::from_ymd_opt(2025, 3, 10);
        let routine = Routine::from_spec("r1".into(), "u1".into(), spec, t0()).unwrap();
        db.insert_routine(&routine).unwrap();

        let loaded = db.get_routine("r1").unwrap().unwrap();
        assert_eq!(loaded, routine);
    }

    #[test]
    fn missing_routine_is_none() {
        let db = Database::open_memory().unwrap();
        assert!(db.get_routine("nope").unwrap().is_none());
    }

    #[test]
    fn stale_replace_is_rejected() {
        let db = Database::open_memory().unwrap();
        let mut routine = stored_routine(&db);

        routine.refill(t0());
        assert!(db.replace_routine(&routine).unwrap());
        // Same snapshot revision again: the stored row has moved on.
        assert!(!db.replace_routine(&routine).unwrap());

        let loaded = db.get_routine("r1").unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
    }

    #[test]
    fn record_dose_writes_routine_and_ledger_together() {
        let db = Database::open_memory().unwrap();
        let mut routine = stored_routine(&db);
        let event = routine.take_dose("d1".into(), t0()).unwrap();

        assert!(db.record_dose(&routine, &event).unwrap());

        let loaded = db.get_routine("r1").unwrap().unwrap();
        assert_eq!(loaded.remaining_quantity, Decimal::from(2));
        assert_eq!(db.list_doses("r1").unwrap(), vec![event]);
    }

    #[test]
    fn stale_record_dose_leaves_no_ledger_entry() {
        let db = Database::open_memory().unwrap();
        let snapshot = stored_routine(&db);

        let mut first = snapshot.clone();
        let e1 = first.take_dose("d1".into(), t0()).unwrap();
        assert!(db.record_dose(&first, &e1).unwrap());

        let mut second = snapshot;
        let e2 = second.take_dose("d2".into(), t0()).unwrap();
        assert!(!db.record_dose(&second, &e2).unwrap());

        assert_eq!(db.list_doses("r1").unwrap().len(), 1);
        let loaded = db.get_routine("r1").unwrap().unwrap();
        assert_eq!(loaded.remaining_quantity, Decimal::from(2));
    }

    #[test]
    fn reminder_candidates_filter_on_time_and_flag() {
        let db = Database::open_memory().unwrap();
        let routine = stored_routine(&db);

        let mut later = routine.clone();
        later.id = "r2".into();
        later.next_dose_time = t0() + Duration::hours(4);
        db.insert_routine(&later).unwrap();

        let due = db.list_reminder_candidates(t0()).unwrap();
        assert_eq!(due.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1"]);

        assert!(db.mark_notified("r1", 0, t0()).unwrap());
        assert!(db.list_reminder_candidates(t0()).unwrap().is_empty());
        // Second mark with the old revision does nothing.
        assert!(!db.mark_notified("r1", 0, t0()).unwrap());
    }

    #[test]
    fn delete_keeps_ledger() {
        let db = Database::open_memory().unwrap();
        let mut routine = stored_routine(&db);
        let event = routine.take_dose("d1".into(), t0()).unwrap();
        db.record_dose(&routine, &event).unwrap();

        assert!(db.delete_routine("r1").unwrap());
        assert!(!db.delete_routine("r1").unwrap());
        assert_eq!(db.list_doses("r1").unwrap().len(), 1);
    }

    #[test]
    fn list_routines_orders_by_next_dose() {
        let db = Database::open_memory().unwrap();
        let routine = stored_routine(&db);

        let mut earlier = routine.clone();
        earlier.id = "r0".into();
        earlier.next_dose_time = t0() - Duration::hours(1);
        db.insert_routine(&earlier).unwrap();

        let mut other_owner = routine;
        other_owner.id = "rx".into();
        other_owner.owner_id = "u2".into();
        db.insert_routine(&other_owner).unwrap();

        let ids: Vec<_> = db
            .list_routines("u1")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r0", "r1"]);
    }

    #[test]
    fn duplicate_email_is_reported_not_raised() {
        let db = Database::open_memory().unwrap();
        let user = User {
            id: "u1".into(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            password_hash: "x".into(),
            created_at: t0(),
        };
        assert!(db.insert_user(&user).unwrap());

        let dup = User {
            id: "u2".into(),
            email: "ANA@example.com".into(),
            ..user
        };
        assert!(!db.insert_user(&dup).unwrap());
        assert_eq!(
            db.find_user_by_email("Ana@Example.com").unwrap().unwrap().id,
            "u1"
        );
    }

    #[test]
    fn dose_owner_survives_routine_delete() {
        let db = Database::open_memory().unwrap();
        let mut routine = stored_routine(&db);
        let event = routine.take_dose("d1".into(), t0()).unwrap();
        db.record_dose(&routine, &event).unwrap();
        db.delete_routine("r1").unwrap();

        let doses = db.list_doses("r1").unwrap();
        assert_eq!(doses[0].owner_id, "u1");
    }

    #[test]
    fn undecodable_row_is_reported_as_corrupt() {
        let db = Database::open_memory().unwrap();
        stored_routine(&db);
        db.conn()
            .execute(
                "UPDATE routines SET remaining_quantity = 'lots' WHERE id = 'r1'",
                [],
            )
            .unwrap();

        let err = db.get_routine("r1").unwrap_err();
        assert!(
            matches!(err, DatabaseError::CorruptRow { ref column, .. } if column == "7"),
            "{err:?}"
        );
    }

    #[test]
    fn kv_store() {
        let db = Database::open_memory().unwrap();
        assert!(db.kv_get("test").unwrap().is_none());
        db.kv_set("test", "hello").unwrap();
        assert_eq!(db.kv_get("test").unwrap().unwrap(), "hello");
        db.kv_delete("test").unwrap();
        assert!(db.kv_get("test").unwrap().is_none());
    }
}
