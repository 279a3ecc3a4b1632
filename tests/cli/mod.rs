/// Tests for the render-jail binary
use crate::write_temp_file;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

fn render_jail() -> Command {
    Command::cargo_bin("render-jail").expect("binary should be built")
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn test_run_reports_quota_rejections() {
    let output = render_jail()
        .args([
            "run",
            "--backend",
            "thread",
            "--max-workers",
            "2",
            "--workers",
            "3",
            "--exit-code",
            "4",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["backend"], "thread");
    assert_eq!(report["spawned"], 2);
    assert_eq!(report["rejected"], 1);
    let workers = report["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    for worker in workers {
        assert_eq!(worker["exit"]["status"], "exited");
        assert_eq!(worker["exit"]["value"], 4);
        assert!(worker["pid"].is_null());
    }
}

#[test]
fn test_run_process_workers() {
    let output = render_jail()
        .args(["run", "--backend", "process", "--workers", "2", "--exit-code", "7"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["sandboxed"], false);
    for worker in report["workers"].as_array().unwrap() {
        assert!(worker["pid"].as_i64().unwrap() > 0);
        assert_eq!(worker["exit"]["value"], 7);
    }
}

#[test]
fn test_run_uses_config_file() {
    let config = write_temp_file(br#"{"max_worker_count": 1, "backend": "thread"}"#);
    let output = render_jail()
        .arg("run")
        .arg("--config")
        .arg(config.path())
        .args(["--workers", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["max_workers"], 1);
    assert_eq!(report["rejected"], 1);
}

#[test]
fn test_compile_then_check_policy() {
    let policy = write_temp_file(b"exit_group: 1\nread: 1\nwrite: 1\n");
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("worker.bpf");

    let output = render_jail()
        .arg("compile-policy")
        .arg(policy.path())
        .arg(&output_path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let compiled = stdout_json(&output)["instructions"].as_u64().unwrap();
    assert!(compiled > 0);

    let output = render_jail()
        .args(["check-policy", "--seccomp", "bpf"])
        .arg(&output_path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["instructions"].as_u64(), Some(compiled));
    assert_eq!(report["logs_failures"], false);
}

#[test]
fn test_compile_policy_accepts_recent_syscalls() {
    let policy = write_temp_file(b"exit_group: 1\nrseq: 1\nclone3: return 38\nclose_range: 1\n");
    let dir = tempfile::tempdir().unwrap();
    render_jail()
        .arg("compile-policy")
        .arg(policy.path())
        .arg(dir.path().join("worker.bpf"))
        .assert()
        .success();
}

#[test]
fn test_check_policy_rejects_malformed_filter() {
    let filter = write_temp_file(&[0u8; 12]);
    render_jail()
        .args(["check-policy", "--seccomp", "bpf"])
        .arg(filter.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Malformed seccomp filter"));
}

#[test]
fn test_thread_backend_with_seccomp_is_rejected() {
    let policy = write_temp_file(b"exit_group: 1\n");
    render_jail()
        .args(["run", "--backend", "thread", "--seccomp", "policy", "--policy"])
        .arg(policy.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("do not support seccomp"));
}

#[test]
fn test_unknown_backend_is_rejected() {
    render_jail()
        .args(["run", "--backend", "vm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown worker backend"));
}
