use assert_cmd::Command;
use tempfile::TempDir;

/// Run the binary in an empty directory with no inherited configuration.
fn folio(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("folio-jobs").unwrap();
    cmd.current_dir(dir.path()).env_clear();
    cmd
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_count_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir).arg("count").output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output).trim(), "0");
}

#[test]
fn test_json_output() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir).args(["--json", "queues"]).output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value, serde_json::json!([]));
}

#[test]
fn test_retry_missing_job_exits_with_not_found() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir).args(["retry", "42"]).output().unwrap();

    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("failed job(s) 42"));
}

#[test]
fn test_forget_missing_job_exits_with_not_found() {
    let dir = TempDir::new().unwrap();
    folio(&dir).args(["failed", "forget", "7"]).assert().code(3);
    folio(&dir).args(["failed", "show", "7"]).assert().code(3);
}

#[test]
fn test_missing_batch_exits_with_not_found() {
    let dir = TempDir::new().unwrap();
    folio(&dir)
        .args(["batch", "show", "6f1c1d7d-5c6a-4f0e-8b3e-1f2a3b4c5d6e"])
        .assert()
        .code(3);
}

#[test]
fn test_retry_all_with_nothing_failed() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir).args(["retry", "--all"]).output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("No failed jobs to retry"));
}

#[test]
fn test_unknown_connection_is_an_error() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir)
        .args(["--connection", "sqs", "count"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("sqs"));
}

#[test]
fn test_invalid_environment_is_an_error() {
    let dir = TempDir::new().unwrap();
    folio(&dir)
        .env("FOLIO_QUEUE_MAX_TRIES", "0")
        .arg("count")
        .assert()
        .code(1);
}

#[test]
fn test_dotenv_file_is_read() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".env"), "FOLIO_QUEUE_CONNECTION=sqs\n").unwrap();

    folio(&dir).arg("count").assert().code(1);
}

#[test]
fn test_destructive_commands_need_force_without_terminal() {
    let dir = TempDir::new().unwrap();
    folio(&dir).arg("flush").assert().code(1);
    folio(&dir).args(["clear", "mail"]).assert().code(1);

    let output = folio(&dir).args(["flush", "--force"]).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("Deleted 0 job(s)"));
}

#[test]
fn test_zero_page_size_is_rejected() {
    let dir = TempDir::new().unwrap();
    folio(&dir)
        .args(["list", "--per-page", "0"])
        .assert()
        .code(1);
}

#[test]
fn test_work_once_on_empty_queue() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir).args(["work", "--once"]).output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("No job available"));
}

#[test]
fn test_work_stops_when_empty() {
    let dir = TempDir::new().unwrap();
    let output = folio(&dir)
        .args(["work", "--stop-when-empty", "--workers", "2", "--queue", "mail"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("Processed 0 job(s)"));
}

#[test]
fn test_work_rejects_timeout_longer_than_lock() {
    let dir = TempDir::new().unwrap();
    folio(&dir)
        .args(["work", "--once", "--timeout", "600"])
        .assert()
        .code(1);
}

#[test]
fn test_bad_arguments_are_usage_errors() {
    let dir = TempDir::new().unwrap();
    folio(&dir).args(["retry"]).assert().code(2);
    folio(&dir).args(["batch", "show", "nope"]).assert().code(2);
}
