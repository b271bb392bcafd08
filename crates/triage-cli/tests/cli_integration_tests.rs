//! CLI integration tests for triage
//!
//! Tests the triage CLI commands end-to-end using assert_cmd. Each test gets
//! its own config directory and database, and runs without an API key.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a command isolated in `dir`
#[allow(deprecated)]
fn triage_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("triage").unwrap();
    cmd.current_dir(dir.path());
    cmd.env("TRIAGE_CONFIG_DIR", dir.path().join("config"));
    cmd.env("TRIAGE_DATABASE", dir.path().join("data").join("triage.db"));
    cmd.env_remove("TRIAGE_API_KEY");
    cmd.env_remove("OPENROUTER_API_KEY");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {:?}", output);
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_help_command() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("AI-assisted support ticket triage"));
}

#[test]
fn test_version_output() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("triage"));
}

#[test]
fn test_doctor_command() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("Triage Health Check"))
        .stdout(predicate::str::contains("[!!] API Key: Not configured"))
        .stdout(predicate::str::contains("[OK] Database: Connected"));
}

#[test]
fn test_config_list_shows_defaults() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow.retries = 2"))
        .stdout(predicate::str::contains("graph.skill_edge_policy = accumulate"));
}

#[test]
fn test_config_set_then_get() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["config", "set", "workflow.similar_tickets", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set workflow.similar_tickets = 5"));

    triage_cmd(&dir)
        .args(["config", "get", "workflow.similar_tickets"])
        .assert()
        .success()
        .stdout(predicate::str::diff("5\n"));
}

#[test]
fn test_config_get_unknown_key_fails() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["config", "get", "nope.nothing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_users_add_and_list() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["users", "add", "mod@example.com", "--role", "moderator", "--skills", "React,CSS"])
        .assert()
        .success()
        .stdout(predicate::str::contains("User created: mod@example.com (moderator)"))
        .stdout(predicate::str::contains("Skills: React, CSS"))
        .stdout(predicate::str::contains("succeeded"));

    triage_cmd(&dir)
        .args(["users", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mod@example.com [moderator] React, CSS"));
}

#[test]
fn test_users_update_changes_role_and_skills() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["users", "add", "dev@example.com", "--skills", "Go", "--quiet"])
        .assert()
        .success();

    triage_cmd(&dir)
        .args(["users", "update", "dev@example.com", "--role", "moderator", "--skills", "Rust,SQL"])
        .assert()
        .success()
        .stdout(predicate::str::contains("User updated: dev@example.com (moderator)"));

    triage_cmd(&dir)
        .args(["users", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dev@example.com [moderator] Rust, SQL"));
}

#[test]
fn test_users_update_unknown_user_fails() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["users", "update", "ghost@example.com", "--role", "admin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_users_add_rejects_unknown_role() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["users", "add", "x@example.com", "--role", "overlord"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid role"));
}

#[test]
fn test_ticket_without_api_key_falls_back_to_admin() {
    let dir = TempDir::new().unwrap();
    let admin_id = stdout_of(
        triage_cmd(&dir).args(["users", "add", "admin@example.com", "--role", "admin", "--quiet"]),
    );

    triage_cmd(&dir)
        .args(["tickets", "new", "Login broken", "--description", "Users cannot log in"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ticket created:"))
        .stdout(predicate::str::contains("Status: TODO"))
        .stdout(predicate::str::contains(format!("Assigned to: {}", admin_id)));
}

#[test]
fn test_ticket_lifecycle_reaches_knowledge_graph() {
    let dir = TempDir::new().unwrap();
    let ticket_id = stdout_of(triage_cmd(&dir).args([
        "tickets",
        "new",
        "Navbar missing",
        "--description",
        "The navbar disappears after login",
        "--quiet",
    ]));

    triage_cmd(&dir)
        .args(["tickets", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Navbar missing"));

    triage_cmd(&dir)
        .args(["tickets", "resolve", &ticket_id, "Fixed the stale effect"])
        .assert()
        .success()
        .stdout(predicate::str::contains("resolved"));

    triage_cmd(&dir)
        .args(["graph", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tickets: 1"))
        .stdout(predicate::str::contains("Vector indexes: 1"));

    triage_cmd(&dir)
        .args(["similar", "navbar disappears"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fixed the stale effect"));

    triage_cmd(&dir)
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("on-ticket-created:"))
        .stdout(predicate::str::contains("on-ticket-resolved:"));
}

#[test]
fn test_tickets_show_rejects_malformed_id() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["tickets", "show", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid ticket id"));
}

#[test]
fn test_tickets_list_json_is_empty_array() {
    let dir = TempDir::new().unwrap();
    triage_cmd(&dir)
        .args(["tickets", "list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}
