//! Smoke tests -- verify the binary runs and its subcommands parse.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    Command::cargo_bin("jobmatrix")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("disposable runtimes"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("jobmatrix")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("jobmatrix"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--concurrency"));
}

#[test]
fn test_plan_lists_jobs_in_config_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("jobmatrix.toml");
    std::fs::write(
        &config,
        r#"
[runtimes.node]
kind = "process"
program = "node"

[runtimes.deno]
kind = "process"
program = "deno"

[plan."b.test.mjs"]
runtimes = ["node", "deno"]

[plan."a.test.mjs"]
runtimes = ["node"]
allocated_ms = "infinite"
"#,
    )
    .unwrap();

    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["plan", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(
            predicate::str::is_match(r"(?s)b\.test\.mjs  \[node\].*b\.test\.mjs  \[deno\].*a\.test\.mjs  \[node\]  allocated=infinite")
                .unwrap(),
        )
        .stdout(predicates::str::contains("3 job(s)"));
}

#[test]
fn test_plan_rejects_unknown_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("jobmatrix.toml");
    std::fs::write(&config, "[plan.\"a.test\"]\nruntimes = [\"nope\"]\n").unwrap();

    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["plan", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown runtime 'nope'"));
}

#[cfg(unix)]
#[test]
fn test_run_failing_worker_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("jobmatrix.toml");
    std::fs::write(
        &config,
        r#"
[runtimes.broken]
kind = "process"
program = "sh"
args = ["-c", "exit 3"]

[plan."a.test"]
runtimes = ["broken"]
"#,
    )
    .unwrap();

    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["run", "--json", "--config"])
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .code(1)
        .stdout(predicates::str::contains("\"disconnected\""));
}

#[cfg(unix)]
fn mirror_config(dir: &std::path::Path, runner: &str) -> std::path::PathBuf {
    let config = dir.join("jobmatrix.toml");
    let body = format!(
        r#"{runner}

[runtimes.echo]
kind = "process"
program = "sh"
args = ["-c", '''printf '%s\n' '{{"jobmatrix":1,"type":"ready"}}'; read -r line; echo hello mirrored; printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{}}}}}}}}' ''']

[plan."a.test"]
runtimes = ["echo"]
"#
    );
    std::fs::write(&config, body).unwrap();
    config
}

#[cfg(unix)]
#[test]
fn test_run_mirrors_console_without_collecting_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror_config(
        dir.path(),
        "[runner]\nmirror_console = true\n\n[defaults]\ncollect_console = false",
    );

    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["run", "--json", "--config"])
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"(?m)^hello mirrored$").unwrap())
        .stdout(predicates::str::contains("hello mirrored\\n").not())
        .stdout(predicates::str::contains("\"completed\""));
}

#[cfg(unix)]
#[test]
fn test_run_collects_console_without_mirroring_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror_config(dir.path(), "[defaults]\ncollect_console = true");

    Command::cargo_bin("jobmatrix")
        .unwrap()
        .args(["run", "--json", "--config"])
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"(?m)^hello mirrored$").unwrap().not())
        .stdout(predicates::str::contains("hello mirrored\\n"));
}
