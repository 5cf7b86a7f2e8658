//! Basic CLI E2E tests.
//!
//! Tests invoke the built binary against a throwaway data directory and
//! verify its JSON output.

use std::path::Path;
use std::process::Command;

use chrono::{Duration, SecondsFormat, Utc};
use serde_json::Value;
use tempfile::TempDir;

/// Run a CLI command with `home` as the data directory.
fn run_cli(home: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_dosewatch"))
        .args(args)
        .env("DOSEWATCH_HOME", home)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

fn run_json(home: &Path, args: &[&str]) -> Value {
    let (stdout, stderr, code) = run_cli(home, args);
    assert_eq!(code, 0, "{args:?} failed: {stderr}");
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("{args:?}: bad JSON ({e}): {stdout}"))
}

fn run_failure(home: &Path, args: &[&str]) -> String {
    let (_, stderr, code) = run_cli(home, args);
    assert_eq!(code, 1, "{args:?} unexpectedly succeeded");
    assert!(stderr.contains("error:"), "missing error prefix: {stderr}");
    stderr
}

/// Fresh data directory with a signed-in user.
fn signed_in_home() -> TempDir {
    let home = tempfile::tempdir().unwrap();
    run_json(home.path(), &["config", "set", "accounts.pbkdf2_iterations", "1000"]);
    run_json(
        home.path(),
        &[
            "user",
            "register",
            "--name",
            "Maria",
            "--email",
            "maria@example.com",
            "--password",
            "secret",
        ],
    );
    home
}

fn rfc3339(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn add_routine(home: &Path, total: &str, first: &str) -> Value {
    run_json(
        home,
        &[
            "routine",
            "add",
            "--patient",
            "Ana",
            "--medication",
            "Amoxicillin",
            "--dose",
            "1",
            "--unit",
            "pill",
            "--total",
            total,
            "--every",
            "8",
            "--first",
            first,
        ],
    )
}

#[test]
fn test_three_doses_then_refill_needed() {
    let home = signed_in_home();
    let first = Utc::now() + Duration::minutes(5);
    let routine = add_routine(home.path(), "3", &rfc3339(first));
    let id = routine["id"].as_str().unwrap();
    assert_eq!(routine["remaining_quantity"], "3");
    assert_eq!(routine["notified"], false);

    for i in 0..3 {
        let at = rfc3339(first + Duration::hours(8 * i));
        let taken = run_json(home.path(), &["routine", "take", id, "--at", &at]);
        assert_eq!(taken["dose"]["quantity"], "1");
        assert_eq!(
            taken["routine"]["remaining_quantity"],
            (2 - i).to_string().as_str()
        );
    }

    let stderr = run_failure(home.path(), &["routine", "take", id]);
    assert!(stderr.contains("Insufficient supply"), "{stderr}");

    let history = run_json(home.path(), &["routine", "history", id]);
    assert_eq!(history.as_array().unwrap().len(), 3);

    let refilled = run_json(home.path(), &["routine", "refill", id]);
    assert_eq!(refilled["remaining_quantity"], "3");
}

#[test]
fn test_edit_keeps_consumed_quantity() {
    let home = signed_in_home();
    let first = Utc::now() + Duration::hours(1);
    let routine = add_routine(home.path(), "10", &rfc3339(first));
    let id = routine["id"].as_str().unwrap();
    for _ in 0..3 {
        run_json(home.path(), &["routine", "take", id]);
    }

    let edited = run_json(home.path(), &["routine", "edit", id, "--total", "5"]);
    assert_eq!(edited["remaining_quantity"], "2");
    assert_eq!(edited["total_quantity"], "5");
    assert_eq!(edited["medication_name"], "Amoxicillin");
}

#[test]
fn test_dashboard_and_reminders() {
    let home = signed_in_home();
    let soon = add_routine(home.path(), "30", &rfc3339(Utc::now() + Duration::minutes(5)));
    add_routine(home.path(), "30", &rfc3339(Utc::now() + Duration::hours(6)));

    let dashboard = run_json(home.path(), &["dashboard"]);
    let pending = dashboard["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], soon["id"]);
    assert_eq!(dashboard["upcoming"].as_array().unwrap().len(), 1);

    let first = run_json(home.path(), &["remind", "check", "--json"]);
    let sent = first["sent"].as_array().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["routine_id"], soon["id"]);

    let second = run_json(home.path(), &["remind", "check", "--json"]);
    assert!(second["sent"].as_array().unwrap().is_empty());
}

#[test]
fn test_delete_keeps_history() {
    let home = signed_in_home();
    let routine = add_routine(home.path(), "3", &rfc3339(Utc::now()));
    let id = routine["id"].as_str().unwrap();
    run_json(home.path(), &["routine", "take", id]);

    let deleted = run_json(home.path(), &["routine", "delete", id]);
    assert_eq!(deleted["deleted"], true);
    run_failure(home.path(), &["routine", "show", id]);

    let history = run_json(home.path(), &["routine", "history", id]);
    assert_eq!(history.as_array().unwrap().len(), 1);

    run_json(
        home.path(),
        &[
            "user",
            "register",
            "--name",
            "Joao",
            "--email",
            "joao@example.com",
            "--password",
            "secret",
        ],
    );
    let stderr = run_failure(home.path(), &["routine", "history", id]);
    assert!(stderr.contains("not found"), "{stderr}");
}

#[test]
fn test_attach_and_detach_prescription() {
    let home = signed_in_home();
    let routine = add_routine(home.path(), "3", &rfc3339(Utc::now()));
    let id = routine["id"].as_str().unwrap();

    let image = home.path().join("receita.png");
    std::fs::write(&image, b"\x89PNG").unwrap();
    let attached = run_json(
        home.path(),
        &["routine", "attach", id, image.to_str().unwrap()],
    );
    let name = attached["prescription_image_ref"].as_str().unwrap();
    assert!(home.path().join("attachments").join(name).exists());

    let pdf = home.path().join("receita.pdf");
    std::fs::write(&pdf, b"%PDF").unwrap();
    run_failure(home.path(), &["routine", "attach", id, pdf.to_str().unwrap()]);

    let detached = run_json(home.path(), &["routine", "detach", id]);
    assert!(detached["prescription_image_ref"].is_null());
    assert!(!home.path().join("attachments").join(name).exists());
}

#[test]
fn test_invalid_routine_is_rejected() {
    let home = signed_in_home();
    let stderr = run_failure(
        home.path(),
        &[
            "routine",
            "add",
            "--patient",
            "Ana",
            "--medication",
            "Amoxicillin",
            "--dose",
            "5",
            "--total",
            "3",
            "--every",
            "8",
            "--first",
            "2025-03-01T08:00:00Z",
        ],
    );
    assert!(stderr.contains("Validation error"), "{stderr}");
    let list = run_json(home.path(), &["routine", "list"]);
    assert!(list.as_array().unwrap().is_empty());
}

#[test]
fn test_session_lifecycle() {
    let home = signed_in_home();
    let me = run_json(home.path(), &["user", "whoami"]);
    assert_eq!(me["email"], "maria@example.com");
    assert!(me.get("password_hash").is_none());

    run_json(home.path(), &["user", "logout"]);
    run_failure(home.path(), &["user", "whoami"]);
    run_failure(home.path(), &["routine", "list"]);

    run_failure(
        home.path(),
        &["user", "login", "--email", "maria@example.com", "--password", "wrong"],
    );
    let stderr = run_failure(
        home.path(),
        &[
            "user",
            "reset-password",
            "--email",
            "maria@example.com",
            "--current-password",
            "guess",
            "--password",
            "new",
        ],
    );
    assert!(stderr.contains("Invalid email or password"), "{stderr}");
    run_json(
        home.path(),
        &[
            "user",
            "reset-password",
            "--email",
            "maria@example.com",
            "--current-password",
            "secret",
            "--password",
            "new",
        ],
    );
    let back = run_json(
        home.path(),
        &["user", "login", "--email", "MARIA@example.com", "--password", "new"],
    );
    assert_eq!(back["id"], me["id"]);
}

#[test]
fn test_config_roundtrip() {
    let home = tempfile::tempdir().unwrap();
    let set = run_json(home.path(), &["config", "set", "reminders.lead_minutes", "15"]);
    assert_eq!(set["value"], "15");

    let get = run_json(home.path(), &["config", "get", "reminders.lead_minutes"]);
    assert_eq!(get["value"], "15");

    run_failure(home.path(), &["config", "get", "nope.missing"]);
    run_failure(home.path(), &["config", "set", "reminders.lead_minutes", "soon"]);

    let reset = run_json(home.path(), &["config", "reset"]);
    assert_eq!(reset["reminders"]["lead_minutes"], 10);
}
