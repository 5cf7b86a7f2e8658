//! Database schema migrations for dosewatch.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 4;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }
    if current_version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            tracing::warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: baseline.
///
/// Tables are created by `Database::migrate()` directly; this only records
/// the version.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    set_schema_version(conn, 1)
}

/// Migration v2: optional routine details.
///
/// Adds:
/// - treatment_end_date: last day of treatment (YYYY-MM-DD)
/// - instructions: free-text administration notes
/// - prescription_image_ref: generated name of an attached prescription image
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    for (column, ddl) in [
        ("treatment_end_date", "ALTER TABLE routines ADD COLUMN treatment_end_date TEXT"),
        ("instructions", "ALTER TABLE routines ADD COLUMN instructions TEXT"),
        (
            "prescription_image_ref",
            "ALTER TABLE routines ADD COLUMN prescription_image_ref TEXT",
        ),
    ] {
        if !has_column(&tx, "routines", column)? {
            tx.execute(ddl, [])?;
        }
    }

    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Migration v3: index backing the reminder poller's query.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_routines_notified_next_dose
         ON routines(notified, next_dose_time)",
        [],
    )?;
    set_schema_version(&tx, 3)?;
    tx.commit()
}

/// Migration v4: owner on dose ledger rows.
///
/// Existing rows take the owner of their routine; rows whose routine is
/// already gone keep an empty owner and are visible to nobody.
fn migrate_v4(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    if !has_column(&tx, "doses", "owner_id")? {
        tx.execute(
            "ALTER TABLE doses ADD COLUMN owner_id TEXT NOT NULL DEFAULT ''",
            [],
        )?;
        tx.execute(
            "UPDATE doses SET owner_id = COALESCE(
                (SELECT owner_id FROM routines WHERE routines.id = doses.routine_id), '')",
            [],
        )?;
    }
    set_schema_version(&tx, 4)?;
    tx.commit()
}

fn has_column(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
