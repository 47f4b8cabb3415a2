//! Integration tests for the `pivot` binary.
//!
//! Each test writes a plan file into a temporary directory and runs the
//! built binary against it with an isolated config location.
#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn pivot(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pivot"))
        .args(args)
        .current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("xdg"))
        .env("RUST_LOG", "warn")
        .env_remove("PIVOT_MAX_PARALLEL")
        .env_remove("PIVOT_AUTO_REPLAN")
        .output()
        .expect("failed to run pivot binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_plan(dir: &Path, body: &str) -> String {
    let path = dir.join("plan.toml");
    std::fs::write(&path, body).unwrap();
    path.to_string_lossy().into_owned()
}

const BUILD_PLAN: &str = r#"
[plan]
goal = "Build the site"

[[tasks]]
id = "fetch"
name = "Fetch sources"
[tasks.parameters]
command = "echo sources > fetched.txt"

[[tasks]]
id = "render"
name = "Render pages"
depends_on = ["fetch"]
[tasks.parameters]
command = "cat fetched.txt"

[[tasks]]
id = "index"
name = "Build index"
depends_on = ["fetch"]
"#;

#[test]
fn validate_prints_execution_order() {
    let tmp = TempDir::new().unwrap();
    let plan = write_plan(tmp.path(), BUILD_PLAN);

    let output = pivot(tmp.path(), &["validate", &plan]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Plan: Build the site"));
    assert!(out.contains("3 task(s)"));
    let fetch = out.find("fetch [").unwrap();
    let render = out.find("render [").unwrap();
    assert!(fetch < render);
}

#[test]
fn validate_rejects_cycles() {
    let tmp = TempDir::new().unwrap();
    let plan = write_plan(
        tmp.path(),
        r#"
[plan]
goal = "Loop"

[[tasks]]
name = "a"
depends_on = ["b"]

[[tasks]]
name = "b"
depends_on = ["a"]
"#,
    );

    let output = pivot(tmp.path(), &["validate", &plan]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cycle"), "stderr: {}", stderr(&output));
}

#[test]
fn run_executes_commands_and_prints_reports() {
    let tmp = TempDir::new().unwrap();
    let plan = write_plan(tmp.path(), BUILD_PLAN);

    let output = pivot(tmp.path(), &["run", &plan, "--max-parallel", "2"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("# Plan: Build the site"));
    assert!(out.contains("- status: completed"));
    assert!(out.contains("# Replanning History Report"));
    assert!(tmp.path().join("fetched.txt").exists());
}

#[test]
fn run_reports_failures_and_exits_non_zero() {
    let tmp = TempDir::new().unwrap();
    let plan = write_plan(
        tmp.path(),
        r#"
[plan]
goal = "Deploy"

[[tasks]]
id = "build"
name = "Build"
[tasks.parameters]
command = "echo compiler exploded >&2; exit 2"

[[tasks]]
id = "ship"
name = "Ship"
depends_on = ["build"]
"#,
    );
    let report = tmp.path().join("report.json");

    let output = pivot(
        tmp.path(),
        &[
            "run",
            &plan,
            "--sequential",
            "--format",
            "json",
            "--output",
            report.to_str().unwrap(),
        ],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("finished failed"), "stderr: {}", stderr(&output));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["tasks"][1]["status"], "skipped");
    assert_eq!(json["tasks"][0]["result"]["task_id"], "build");
    assert!(
        json["tasks"][0]["result"]["message"]
            .as_str()
            .unwrap()
            .contains("compiler exploded")
    );
}

#[test]
fn auto_replan_retries_flaky_commands() {
    let tmp = TempDir::new().unwrap();
    let plan = write_plan(
        tmp.path(),
        r#"
[plan]
goal = "Flaky"

[[tasks]]
id = "flaky"
name = "Flaky step"
[tasks.parameters]
command = "if [ -f seen ]; then exit 0; else touch seen; exit 1; fi"
"#,
    );
    let config = tmp.path().join("engine.toml");
    std::fs::write(&config, "[monitor]\nfailure_threshold = 1\n").unwrap();

    let output = pivot(
        tmp.path(),
        &[
            "--config",
            config.to_str().unwrap(),
            "run",
            &plan,
            "--auto-replan",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("- replans: 1"));
    assert!(out.contains("`task-failed` -> replace"));
}

#[test]
fn init_writes_config_once() {
    let tmp = TempDir::new().unwrap();

    let output = pivot(tmp.path(), &["init"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let path = tmp.path().join("xdg").join("pivot").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("max_parallel = 4"));

    let again = pivot(tmp.path(), &["init"]);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("already exists"));

    let forced = pivot(tmp.path(), &["init", "--force"]);
    assert!(forced.status.success());
}
