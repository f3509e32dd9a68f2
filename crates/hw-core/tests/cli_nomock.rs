//! CLI tests for the `hostwatch` binary against real on-disk queues.
//!
//! Validates:
//! - `config validate` / `config show` output and exit codes
//! - `status` reports queue depth and primary reachability
//! - `status` inspects a spool owned by another process without touching it
//! - `replay` drains a queue left by an earlier process into the primary store
//! - `replay` refuses a spool owned by another process
//! - `run --dry-run` stops cleanly on SIGINT

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use hw_common::{LocalSnapshotId, SampleCycle, TelemetryBatch};
use hw_telemetry::{DirectoryStore, DurableQueue, SpoolSettings};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn hostwatch() -> Command {
    let mut cmd = cargo_bin_cmd!("hostwatch");
    cmd.timeout(Duration::from_secs(60));
    cmd.env_remove("HOSTWATCH_CONFIG");
    cmd.env("HOSTWATCH_LOG", "warn");
    cmd
}

struct Fixture {
    dir: TempDir,
    config_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut Value)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = json!({
            "sampling": { "interval_secs": 1, "host_id": "test-host" },
            "replay": { "interval_secs": 1, "store_timeout_ms": 2000 },
            "spool": {
                "dir": dir.path().join("spool"),
                "event_log_dir": dir.path().join("events"),
            },
            "primary": { "dir": dir.path().join("primary") },
        });
        adjust(&mut config);

        let config_path = dir.path().join("hostwatch.json");
        fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        Fixture { dir, config_path }
    }

    fn spool_dir(&self) -> PathBuf {
        self.dir.path().join("spool")
    }

    fn primary_dir(&self) -> PathBuf {
        self.dir.path().join("primary")
    }

    fn config_arg(&self) -> &Path {
        &self.config_path
    }

    /// Leave `count` batches queued, as a process that lost the primary would.
    fn seed_queue(&self, count: u64) {
        let mut queue = DurableQueue::open(SpoolSettings::new(self.spool_dir())).unwrap();
        for id in 1..=count {
            let batch =
                TelemetryBatch::new(LocalSnapshotId(id), "test-host", SampleCycle::default());
            queue.enqueue(batch).unwrap();
        }
    }

    fn run_json(&self, args: &[&str], expected_code: i32) -> Value {
        let output = hostwatch()
            .arg("--config")
            .arg(self.config_arg())
            .args(args)
            .assert()
            .code(expected_code)
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).expect("stdout should be JSON")
    }
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn test_config_validate_accepts_valid_file() {
    let fx = Fixture::new();
    let json = fx.run_json(&["config", "validate"], 0);
    assert_eq!(json["status"], "valid");
    assert_eq!(json["source"]["resolution"], "cli_flag");
    assert!(json["source"]["hash"].as_str().is_some_and(|h| h.len() == 64));
}

#[test]
fn test_config_validate_rejects_zero_capacity() {
    let fx = Fixture::with_config(|c| c["spool"]["max_batches"] = json!(0));
    let json = fx.run_json(&["config", "validate"], 10);
    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["code"], 11);
    assert_eq!(json["error"]["context"]["field"], "spool.max_batches");
}

#[test]
fn test_config_validate_missing_file_is_args_error() {
    let dir = TempDir::new().unwrap();
    hostwatch()
        .arg("--config")
        .arg(dir.path().join("absent.json"))
        .args(["config", "validate"])
        .assert()
        .code(10);
}

#[test]
fn test_config_show_fills_defaults() {
    let fx = Fixture::new();
    let json = fx.run_json(&["config", "show"], 0);
    assert_eq!(json["config"]["replay"]["rejection_ceiling"], 5);
    assert_eq!(json["config"]["spool"]["max_batches"], 10_000);
    assert_eq!(json["config"]["sampling"]["host_id"], "test-host");
}

// ============================================================================
// Status
// ============================================================================

#[test]
fn test_status_empty_queue_is_clean() {
    let fx = Fixture::new();
    let json = fx.run_json(&["status"], 0);
    assert_eq!(json["queue"]["depth"], 0);
    assert_eq!(json["queue"]["total_bytes"], 0);
    assert_eq!(json["primary"]["reachable"], false);
}

#[test]
fn test_status_reports_backlog_as_degraded() {
    let fx = Fixture::new();
    fx.seed_queue(3);
    let json = fx.run_json(&["status"], 1);
    assert_eq!(json["queue"]["depth"], 3);
    assert_eq!(json["queue"]["oldest_local_snapshot_id"], 1);
    assert_eq!(json["queue"]["newest_local_snapshot_id"], 3);
    assert_eq!(json["recovery"]["loaded"], 3);
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn test_replay_drains_queue_into_primary() {
    let fx = Fixture::new();
    fx.seed_queue(3);
    fs::create_dir_all(fx.primary_dir()).unwrap();

    let report = fx.run_json(&["replay"], 0);
    assert_eq!(report["pending_at_start"], 3);
    assert_eq!(report["replayed"].as_array().map(Vec::len), Some(3));
    assert_eq!(report["remaining"], 0);

    let stored = DirectoryStore::new(fx.primary_dir()).read_all().unwrap();
    let mut ids: Vec<u64> = stored
        .iter()
        .map(|doc| doc.batch.local_snapshot_id().0)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    let status = fx.run_json(&["status"], 0);
    assert_eq!(status["queue"]["depth"], 0);
}

#[test]
fn test_replay_with_primary_down_keeps_everything() {
    let fx = Fixture::new();
    fx.seed_queue(2);

    let report = fx.run_json(&["replay"], 1);
    assert_eq!(report["stopped_on_connectivity"], true);
    assert_eq!(report["remaining"], 2);
    assert!(report["replayed"].as_array().is_some_and(|r| r.is_empty()));

    let status = fx.run_json(&["status"], 1);
    assert_eq!(status["queue"]["depth"], 2);
}

// ============================================================================
// Spool ownership
// ============================================================================

#[cfg(unix)]
#[test]
fn test_status_reads_spool_owned_by_another_process() {
    let fx = Fixture::new();
    fx.seed_queue(2);
    let _owner = DurableQueue::open(SpoolSettings::new(fx.spool_dir())).unwrap();
    let inflight = fx.spool_dir().join("inflight.batch.tmp");
    fs::write(&inflight, b"partial").unwrap();

    let json = fx.run_json(&["status"], 1);
    assert_eq!(json["queue"]["depth"], 2);
    assert_eq!(json["owner_pid"], std::process::id());
    // The owner may be mid-write; status must leave its temp file alone
    assert!(inflight.exists());
}

#[test]
fn test_status_without_owner_reports_null_pid() {
    let fx = Fixture::new();
    fx.seed_queue(1);
    let json = fx.run_json(&["status"], 1);
    assert!(json["owner_pid"].is_null());
}

#[cfg(unix)]
#[test]
fn test_replay_refuses_spool_owned_by_another_process() {
    let fx = Fixture::new();
    fx.seed_queue(2);
    fs::create_dir_all(fx.primary_dir()).unwrap();
    let owner = DurableQueue::open(SpoolSettings::new(fx.spool_dir())).unwrap();

    let output = hostwatch()
        .arg("--config")
        .arg(fx.config_arg())
        .arg("replay")
        .assert()
        .code(21)
        .get_output()
        .clone();
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = stderr.lines().last().unwrap_or_default();
    let err: Value = serde_json::from_str(last).expect("last stderr line should be JSON");
    assert_eq!(err["code"], 42);
    assert_eq!(err["context"]["pid"], std::process::id());

    // Nothing was replayed behind the owner's back
    assert_eq!(owner.len(), 2);
    assert!(DirectoryStore::new(fx.primary_dir()).read_all().unwrap().is_empty());
}

// ============================================================================
// Run
// ============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_run_dry_run_stops_on_sigint() {
    use std::process::{Command as StdCommand, Stdio};

    let fx = Fixture::new();
    let mut child = StdCommand::new(env!("CARGO_BIN_EXE_hostwatch"))
        .arg("--config")
        .arg(fx.config_arg())
        .args(["run", "--dry-run"])
        .env_remove("HOSTWATCH_CONFIG")
        .env("HOSTWATCH_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(1500));
    // SAFETY: signalling our own child process
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) };
    assert_eq!(rc, 0);

    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    // 1 when the final sample was caught by shutdown and left queued
    assert!(
        matches!(output.status.code(), Some(0) | Some(1)),
        "unexpected exit: {:?}\n{}",
        output.status,
        stderr
    );
    assert!(stderr.contains("daemon started"), "{}", stderr);
    assert!(stderr.contains("daemon stopped"), "{}", stderr);

    // Dry run never touches the primary directory
    assert!(!fx.primary_dir().exists());
}
