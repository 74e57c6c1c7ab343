//! Integration tests for supervised runs.
//!
//! Jobs are small `sh` scripts, so these tests need a Unix shell and
//! `sleep` on `PATH`. They verify that the supervisor:
//! 1. Classifies normal exits, failures and intentional terminations
//! 2. Escalates from SIGINT to SIGKILL when the job ignores the interrupt
//! 3. Persists checkpoints as they are reported and auto-resumes from them
//! 4. Keeps reading output that is not valid UTF-8
#![cfg(unix)]

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use backprop_harness::{
    governor::{Governor, GovernorPolicy, ResourceSampler, ResourceState, TokenBucket},
    probe::{DeviceProbeChain, ProbeMode},
    store::{RunRecord, RunStatus, RunStore},
    supervisor::{RunOutcome, RunSettings, Supervisor},
};
use tempfile::tempdir;

struct PlentySampler;

impl ResourceSampler for PlentySampler {
    fn sample(&self) -> ResourceState {
        ResourceState {
            ram_free_gb: 64.0,
            cpu_load: 0.1,
            monitoring_failed: false,
        }
    }
}

fn governor(policy: GovernorPolicy) -> Governor {
    Governor::new(
        policy,
        TokenBucket::default(),
        Box::new(PlentySampler),
        DeviceProbeChain::new(ProbeMode::None),
    )
}

fn store_dir(dir: &Path) -> PathBuf {
    dir.join("store")
}

fn open_store(dir: &Path) -> RunStore {
    let mut store = RunStore::new(store_dir(dir));
    store.init().unwrap();
    store
}

/// Write `body` as a shell script and build a supervisor that runs it.
fn supervisor(dir: &Path, body: &str, configure: impl FnOnce(&mut RunSettings)) -> Supervisor {
    let script = dir.join("job.sh");
    fs::write(&script, body).unwrap();

    let mut settings = RunSettings::new(&script, "test-run");
    settings.interpreter = "sh".to_string();
    settings.max_run = Duration::from_secs(30);
    settings.grace = Duration::from_secs(5);
    configure(&mut settings);

    Supervisor::new(settings, governor(GovernorPolicy::default()), open_store(dir))
}

#[tokio::test]
async fn test_completed_run_records_progress_and_checkpoints() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(
        dir.path(),
        r#"
echo "loading data"
echo '{"step": 1, "loss": 2.5}'
echo '{"event": "checkpoint_saved", "path": "ckpt/step-1.pt"}'
echo '{"step": 2, "loss": 1.25}'
exit 0
"#,
        |_| {},
    );

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Completed);
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.error, None);
    let progress = result.last_progress.unwrap();
    assert_eq!(progress.step, 2);
    assert!((progress.loss - 1.25).abs() < f64::EPSILON);

    let store = open_store(dir.path());
    let record = store.get_run("test-run").unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.end_time.is_some());
    assert_eq!(record.last_step, Some(2));
    assert_eq!(store.get_latest_checkpoint("test-run"), Some("ckpt/step-1.pt"));
}

#[tokio::test]
async fn test_failure_surfaces_stderr_and_keeps_checkpoint() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(
        dir.path(),
        r#"
echo '{"event": "checkpoint_saved", "path": "ckpt/early.pt"}'
echo "CUDA error: out of memory" >&2
exit 3
"#,
        |_| {},
    );

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Error);
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.error.unwrap().contains("out of memory"));

    let store = open_store(dir.path());
    assert_eq!(store.get_run("test-run").unwrap().status, RunStatus::Failed);
    assert_eq!(store.get_latest_checkpoint("test-run"), Some("ckpt/early.pt"));
}

#[tokio::test]
async fn test_invalid_utf8_output_does_not_stop_ingestion() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(
        dir.path(),
        r#"
printf 'progress \377\376 bar\n'
i=0
while [ $i -lt 2000 ]; do
    echo "log line $i"
    i=$((i + 1))
done
echo '{"step": 7, "loss": 0.75}'
echo '{"event": "checkpoint_saved", "path": "ckpt/after.pt"}'
exit 0
"#,
        |_| {},
    );

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.last_progress.unwrap().step, 7);

    let store = open_store(dir.path());
    assert_eq!(store.get_latest_checkpoint("test-run"), Some("ckpt/after.pt"));
}

#[tokio::test]
async fn test_timebox_interrupts_job() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exec sleep 30\n", |s| {
        s.max_run = Duration::from_millis(300);
    });

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Timeboxed);
    assert!(result.success);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.error, None);
    assert!(result.duration < Duration::from_secs(5), "SIGINT should suffice");

    let store = open_store(dir.path());
    assert_eq!(
        store.get_run("test-run").unwrap().status,
        RunStatus::Timeboxed
    );
}

#[tokio::test]
async fn test_timebox_kills_job_that_ignores_interrupt() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "trap '' INT\nexec sleep 30\n", |s| {
        s.max_run = Duration::from_millis(300);
        s.grace = Duration::from_millis(500);
    });

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Timeboxed);
    assert!(result.success);
    assert!(result.duration >= Duration::from_millis(800));
    assert!(result.duration < Duration::from_secs(10));
}

#[tokio::test]
async fn test_manual_stop() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exec sleep 30\n", |_| {});

    let stop = sup.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.stop();
        // Idempotent.
        stop.stop();
    });

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Stopped);
    assert!(result.success);

    let store = open_store(dir.path());
    assert_eq!(store.get_run("test-run").unwrap().status, RunStatus::Stopped);
}

#[tokio::test]
async fn test_stop_does_not_carry_over_to_next_run() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exit 0\n", |_| {});
    assert_eq!(sup.run().await.reason, RunOutcome::Completed);

    // Stop arrives after the job already exited.
    sup.stop_handle().stop();

    fs::write(&sup.settings().script, "sleep 1\nexit 0\n").unwrap();
    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(
        open_store(dir.path()).get_run("test-run").unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn test_self_interrupt_is_intentional() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "kill -INT $$\nsleep 5\n", |_| {});

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Timeboxed);
    assert!(result.success);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.error, None);
}

#[tokio::test]
async fn test_job_that_handles_interrupt_and_exits_cleanly_completed() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(
        dir.path(),
        r#"
trap 'echo "{\"event\": \"checkpoint_saved\", \"path\": \"ckpt/final.pt\"}"; exit 0' INT
while true; do sleep 0.1; done
"#,
        |s| s.max_run = Duration::from_millis(300),
    );

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(
        open_store(dir.path()).get_latest_checkpoint("test-run"),
        Some("ckpt/final.pt")
    );
}

#[tokio::test]
async fn test_auto_resume_from_latest_checkpoint() {
    let dir = tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let script = dir.path().join("job.sh");

    // Previous attempt left two checkpoints behind.
    let mut previous = RunRecord::new("test-run", None, script.display().to_string());
    previous.append_checkpoint("ckpt/a.pt");
    previous.append_checkpoint("ckpt/b.pt");
    previous.finish(RunStatus::Timeboxed);
    open_store(dir.path()).save_run(&previous).unwrap();

    let mut sup = supervisor(
        dir.path(),
        &format!("echo \"$@\" > '{}'\n", args_file.display()),
        |_| {},
    );
    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::Completed);

    let args = fs::read_to_string(&args_file).unwrap();
    assert!(args.contains("--run-id test-run"), "{args}");
    assert!(args.contains("--max-minutes 0.5"), "{args}");
    assert!(args.contains("--resume-from ckpt/b.pt"), "{args}");

    let record = open_store(dir.path()).get_run("test-run").cloned().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.checkpoints.len(), 2);
}

#[tokio::test]
async fn test_explicit_resume_wins() {
    let dir = tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let script = dir.path().join("job.sh");

    let mut previous = RunRecord::new("test-run", None, script.display().to_string());
    previous.append_checkpoint("ckpt/stored.pt");
    previous.finish(RunStatus::Failed);
    open_store(dir.path()).save_run(&previous).unwrap();

    let mut sup = supervisor(
        dir.path(),
        &format!("echo \"$@\" > '{}'\n", args_file.display()),
        |s| s.resume_from = Some("ckpt/chosen.pt".into()),
    );
    sup.run().await;

    let args = fs::read_to_string(&args_file).unwrap();
    assert!(args.contains("--resume-from ckpt/chosen.pt"), "{args}");
}

#[tokio::test]
async fn test_spawn_error_is_recorded() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exit 0\n", |s| {
        s.interpreter = "definitely-not-an-interpreter".into();
    });

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::SpawnError);
    assert!(!result.success);
    assert!(result.error.is_some());

    let store = open_store(dir.path());
    assert_eq!(store.get_run("test-run").unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_missing_script_is_not_started() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exit 0\n", |s| {
        s.script = s.script.with_file_name("missing.sh");
    });

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::ScriptUnavailable);
    assert!(!result.success);
    assert!(open_store(dir.path()).get_run("test-run").is_none());
}

#[tokio::test]
async fn test_governor_rejection_is_not_started() {
    let dir = tempdir().unwrap();
    let mut sup = supervisor(dir.path(), "exit 0\n", |_| {});
    sup.governor_mut().policy_mut().min_free_ram_gb = 1024.0;

    let result = sup.run().await;
    assert_eq!(result.reason, RunOutcome::GovernorRejected);
    assert!(!result.success);
    assert!(result.error.unwrap().contains("low RAM"));
    assert!(open_store(dir.path()).get_run("test-run").is_none());
}
