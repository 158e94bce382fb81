#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn semiont(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("semiont").unwrap();
    cmd.current_dir(dir.path())
        .env("SEMIONT_ROOT", dir.path())
        .env_remove("SEMIONT_ENV")
        .env_remove("RUST_LOG");
    cmd
}

/// A project whose `local` environment runs every service on the mock platform.
fn mock_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("semiont.json"),
        r#"{"project": "demo", "defaults": {"platform": {"default": "mock"}}}"#,
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("environments")).unwrap();
    std::fs::write(
        dir.path().join("environments/local.json"),
        r#"{
            "services": {
                "database": {"port": 5432},
                "backend": {"port": 4000},
                "frontend": {"port": 3000}
            }
        }"#,
    )
    .unwrap();
    dir
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

// ---------------------------------------------------------------------------
// Service commands
// ---------------------------------------------------------------------------

#[test]
fn start_all_services_summary() {
    let dir = mock_project();
    semiont(&dir)
        .args(["start", "--environment", "local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok      database (mock)"))
        .stdout(predicate::str::contains("start [local]: 3 succeeded, 0 failed (3 total)"));
}

#[test]
fn start_json_envelope() {
    let dir = mock_project();
    let output = semiont(&dir)
        .args(["start", "-e", "local", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["command"], "start");
    assert_eq!(json["environment"], "local");
    assert_eq!(json["summary"]["total"], 3);
    assert_eq!(json["summary"]["succeeded"], 3);
    let entities: Vec<&str> = json["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["entity"].as_str().unwrap())
        .collect();
    assert_eq!(entities, vec!["database", "backend", "frontend"]);
    assert_eq!(json["results"][0]["platform"], "mock");
    assert_eq!(json["executionContext"]["dryRun"], false);
}

#[test]
fn environment_can_come_from_env_var() {
    let dir = mock_project();
    semiont(&dir)
        .env("SEMIONT_ENV", "local")
        .args(["check", "--service", "backend", "--output", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("command: check"))
        .stdout(predicate::str::contains("status: stopped"));
}

#[test]
fn stop_runs_data_services_last() {
    let dir = mock_project();
    let output = semiont(&dir)
        .args(["stop", "-e", "local", "-o", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    let entities: Vec<&str> = json["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["entity"].as_str().unwrap())
        .collect();
    assert_eq!(entities, vec!["database", "backend", "frontend"]);
}

#[test]
fn restore_of_unknown_backup_exits_nonzero() {
    let dir = mock_project();
    let output = semiont(&dir)
        .args(["restore", "-e", "local", "--backup-id", "nope", "-o", "json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let json = stdout_json(&output);
    // a missing backup is a failed result, not an error, so every service is tried
    assert_eq!(json["results"][0]["entity"], "frontend");
    assert!(json["results"][0]["error"].as_str().unwrap().contains("backup 'nope' not found"));
    assert_eq!(json["summary"]["total"], 3);
    assert_eq!(json["summary"]["failed"], 3);
}

#[test]
fn dry_run_is_reported() {
    let dir = mock_project();
    semiont(&dir)
        .args(["stop", "-e", "local", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[dry run]"));
}

#[test]
fn table_output_has_header() {
    let dir = mock_project();
    semiont(&dir)
        .args(["backup", "-e", "local", "--output", "table"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SERVICE"))
        .stdout(predicate::str::contains("backupId=mock-backup-database-"));
}

#[test]
fn exec_needs_a_single_service() {
    let dir = mock_project();
    semiont(&dir)
        .args(["exec", "-e", "local", "--", "ls"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--service NAME"));
}

#[test]
fn exec_runs_on_one_service() {
    let dir = mock_project();
    semiont(&dir)
        .args(["exec", "-e", "local", "--service", "backend", "--", "echo", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mock exec on backend: echo hi"));
}

#[test]
fn secret_list_on_mock() {
    let dir = mock_project();
    semiont(&dir)
        .args(["secret", "list", "-e", "local", "--service", "backend", "-q"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn missing_environment_lists_available_ones() {
    let dir = mock_project();
    semiont(&dir)
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error: no environment specified"))
        .stderr(predicate::str::contains("local"));
}

#[test]
fn unknown_environment_is_an_error() {
    let dir = mock_project();
    semiont(&dir)
        .args(["start", "-e", "staging"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("environment 'staging' not found"));
}

#[test]
fn unconfigured_service_fails_the_envelope() {
    let dir = mock_project();
    let output = semiont(&dir)
        .args(["start", "-e", "local", "--service", "mcp", "-o", "json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = stdout_json(&output);
    assert!(json["results"].as_array().unwrap().is_empty());
    assert_eq!(json["summary"]["failed"], 1);
    assert!(json["error"].as_str().unwrap().contains("mcp"));
}

// ---------------------------------------------------------------------------
// semiont handlers
// ---------------------------------------------------------------------------

#[test]
fn handlers_lists_registry() {
    let dir = TempDir::new().unwrap();
    semiont(&dir)
        .args(["handlers", "--platform", "aws"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check:ecs-fargate"))
        .stdout(predicate::str::contains("backup:rds"));
}

#[test]
fn handlers_json() {
    let dir = TempDir::new().unwrap();
    let output = semiont(&dir)
        .args(["handlers", "--platform", "external", "-o", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    let ops: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["operation"].as_str().unwrap())
        .collect();
    assert!(ops.contains(&"start:generic"));
    assert!(ops.contains(&"check:database"));
}

#[test]
fn unknown_platform_is_rejected_by_parser() {
    let dir = TempDir::new().unwrap();
    semiont(&dir)
        .args(["handlers", "--platform", "gcp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("gcp"));
}
