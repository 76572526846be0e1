//! E2E CLI tests for operator commands:
//! - `ms scale`, `ms migrate --to/--auto`, `ms sweep`
//! - `ms recompute`, `ms repair`, `ms purge`
//! - `ms submit-view` reconciliation
//! - logging controls (`MILESTORE_LOG`, `MILESTORE_LOG_FORMAT`)

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;

fn ms(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("ms"));
    cmd.env_remove("MILESTORE_ROOT");
    cmd.env_remove("MILESTORE_LOG_FORMAT");
    cmd.env("MILESTORE_WRITER", "operator");
    cmd.env("MILESTORE_LOG", "error");
    cmd.arg("--root").arg(root);
    cmd
}

fn json_out(root: &Path, args: &[&str]) -> Value {
    let output = ms(root)
        .args(args)
        .arg("--json")
        .output()
        .expect("ms should not crash");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

/// A store holding `count` units, every third one started.
fn seeded(count: usize) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path();
    ms(root).arg("init").assert().success();
    for n in 0..count {
        let id = format!("unit-{n}");
        json_out(
            root,
            &["create", &id, "--id", &id, "--phase", "plan:0.4", "--phase", "ship:0.6"],
        );
        if n % 3 == 0 {
            json_out(root, &["start", &id, "plan"]);
        }
    }
    dir
}

fn ids(list: &Value) -> Vec<String> {
    let mut ids: Vec<String> = list
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|d| d["id"].as_str().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

#[test]
fn scale_reports_metrics_and_stays_when_small() {
    let dir = seeded(4);
    let scale = json_out(dir.path(), &["scale"]);
    assert_eq!(scale["decision"]["current"], "flat-file");
    assert_eq!(scale["decision"]["action"], "stay");
    assert_eq!(scale["decision"]["metrics"]["document_count"], 4);
    assert_eq!(scale["manifest"]["active"]["kind"], "flat-file");

    let migrated = json_out(dir.path(), &["migrate", "--auto"]);
    assert_eq!(migrated["migrated"], false);
    assert_eq!(migrated["backend"], "flat-file");
}

#[test]
fn forced_migration_keeps_every_answer() {
    let dir = seeded(9);
    let root = dir.path();
    let before = json_out(root, &["list"]);
    let active_before = json_out(root, &["list", "--status", "active"]);

    let out = json_out(root, &["migrate", "--to", "indexed-hybrid"]);
    assert_eq!(out["migrated"], true);
    assert_eq!(out["report"]["from"], "flat-file");
    assert_eq!(out["report"]["to"], "indexed-hybrid");
    assert_eq!(out["report"]["units"], 9);

    assert_eq!(ids(&json_out(root, &["list"])), ids(&before));
    assert_eq!(
        ids(&json_out(root, &["list", "--status", "active"])),
        ids(&active_before)
    );
    let scale = json_out(root, &["scale"]);
    assert_eq!(scale["manifest"]["active"]["kind"], "indexed-hybrid");
    assert_eq!(scale["manifest"]["retired"].as_array().map(Vec::len), Some(1));

    // Writes keep working on the new backend.
    let reported = json_out(root, &["progress", "unit-0", "plan", "0.5"]);
    assert_eq!(reported["progress_percent"], 20);

    // Still inside the grace period.
    let swept = json_out(root, &["sweep"]);
    assert_eq!(swept["retired_removed"].as_array().map(Vec::len), Some(0));
}

#[test]
fn migration_to_database_and_back() {
    let dir = seeded(5);
    let root = dir.path();
    let up = json_out(root, &["migrate", "--to", "embedded-database"]);
    assert_eq!(up["backend"], "embedded-database");
    let down = json_out(root, &["migrate", "--to", "flat"]);
    assert_eq!(down["backend"], "flat-file");
    assert_eq!(ids(&json_out(root, &["list"])).len(), 5);
}

#[test]
fn init_can_choose_the_first_backend() {
    let dir = TempDir::new().unwrap();
    let out = json_out(dir.path(), &["init", "--backend", "embedded-database"]);
    assert_eq!(out["backend"], "embedded-database");
    let config = std::fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(config.contains("embedded-database"), "{config}");
}

#[test]
fn recompute_finds_nothing_to_fix_in_a_healthy_store() {
    let dir = seeded(3);
    let rows = json_out(dir.path(), &["recompute", "--all"]);
    let rows = rows.as_array().expect("array");
    assert_eq!(rows.len(), 3);
    for row in rows {
        assert_eq!(row["document_repaired"], false);
        assert_eq!(row["stored_percent"], row["computed_percent"]);
    }

    let one = json_out(dir.path(), &["recompute", "unit-0"]);
    assert_eq!(one[0]["id"], "unit-0");

    let repair = json_out(dir.path(), &["repair"]);
    assert_eq!(repair["torn_writes_repaired"], 0);
}

#[test]
fn purge_removes_only_old_archived_units() {
    let dir = seeded(2);
    let root = dir.path();
    json_out(root, &["archive", "unit-1"]);

    let kept = json_out(root, &["purge"]);
    assert_eq!(kept["purged"].as_array().map(Vec::len), Some(0));

    let purged = json_out(root, &["purge", "--older-than-days", "0"]);
    assert_eq!(purged["purged"][0], "unit-1");
    assert_eq!(ids(&json_out(root, &["list"])), vec!["unit-0".to_string()]);
}

#[test]
fn views_reconcile_through_the_cli() {
    let dir = seeded(2);
    let root = dir.path();
    let execution = json_out(root, &["show", "unit-0"]);
    let mut planning = execution.clone();
    planning["title"] = json!("unit-0, re-planned");
    planning["dependencies"] = json!(["unit-1"]);

    let plan_path = root.join("plan.json");
    let exec_path = root.join("exec.json");
    std::fs::write(&plan_path, planning.to_string()).unwrap();
    std::fs::write(&exec_path, execution.to_string()).unwrap();

    let first = json_out(root, &["submit-view", "planning", plan_path.to_str().unwrap()]);
    assert_eq!(first["outcome"], "pending");
    assert_eq!(first["waiting_for"], "execution");

    let second = json_out(root, &["submit-view", "execution", exec_path.to_str().unwrap()]);
    assert_eq!(second["outcome"], "reconciled");
    assert_eq!(second["status"], "active");

    let shown = json_out(root, &["show", "unit-0"]);
    assert_eq!(shown["title"], "unit-0, re-planned");
    assert_eq!(shown["reconciled"], true);
    assert_eq!(shown["dependencies"][0], "unit-1");
}

#[test]
fn json_log_format_goes_to_stderr() {
    let dir = seeded(1);
    ms(dir.path())
        .env("MILESTORE_LOG", "milestore=info")
        .env("MILESTORE_LOG_FORMAT", "json")
        .args(["start", "unit-0", "plan", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("\"level\":\"INFO\""))
        .stdout(predicate::str::contains("\"status\""));
}
