//! Supervised execution of one training job.
//!
//! A run moves `Pending -> Running -> terminal`. Admission, the script check
//! and the record update all happen before the job is spawned. While the job
//! runs, its stdout is read as newline-delimited JSON progress events and a
//! timebox timer is armed. When the timebox fires (or a [`StopHandle`] is
//! used) the job gets `SIGINT`, then `SIGKILL` once the grace period has
//! passed. Both timers die with the select loop as soon as the job exits.

use std::{
    collections::VecDeque,
    fmt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStdout, Command},
    sync::watch,
};

use crate::{
    config::HarnessConfig,
    governor::Governor,
    store::{RunRecord, RunStatus, RunStore, now_millis},
};

/// Bound on reading buffered output after the job has exited. Grandchildren
/// that inherited the pipes could otherwise hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 200;

/// Framework hint passed to the script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    /// Let the script decide. No flag is passed.
    #[default]
    Auto,
    Pytorch,
    Tensorflow,
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "pytorch" => Ok(Self::Pytorch),
            "tensorflow" => Ok(Self::Tensorflow),
            other => Err(format!(
                "unknown framework '{other}' (expected pytorch, tensorflow or auto)"
            )),
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Pytorch => "pytorch",
            Self::Tensorflow => "tensorflow",
        })
    }
}

/// Everything needed to launch and police one job.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub script: PathBuf,
    pub run_id: String,
    pub name: Option<String>,
    pub framework: Framework,
    /// Timebox.
    pub max_run: Duration,
    pub checkpoint_every: Option<Duration>,
    /// Explicit resume point. When unset the store's latest checkpoint for
    /// this run id is used.
    pub resume_from: Option<String>,
    pub interpreter: String,
    /// Delay between `SIGINT` and `SIGKILL`.
    pub grace: Duration,
}

impl RunSettings {
    /// Settings with the default timebox (10 minutes) and grace (30 s).
    #[must_use]
    pub fn new(script: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            run_id: run_id.into(),
            name: None,
            framework: Framework::Auto,
            max_run: Duration::from_secs(10 * 60),
            checkpoint_every: None,
            resume_from: None,
            interpreter: "python".to_string(),
            grace: Duration::from_secs(30),
        }
    }

    /// Convert the `[run]` section. Call [`HarnessConfig::validate`] first:
    /// non-positive durations are clamped to zero here, not rejected.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        let run = &config.run;
        Self {
            script: PathBuf::from(&run.script),
            run_id: run.run_id.clone().unwrap_or_else(default_run_id),
            name: run.name.clone(),
            framework: run.framework,
            max_run: minutes(run.max_run_minutes),
            checkpoint_every: run.checkpoint_every_minutes.map(minutes),
            resume_from: run.resume_from.clone(),
            interpreter: run.interpreter.clone(),
            grace: Duration::from_secs(run.grace_secs),
        }
    }

    /// Arguments passed to the interpreter, script first.
    #[must_use]
    pub fn job_args(&self, resume_from: Option<&str>) -> Vec<String> {
        let mut args = vec![
            self.script.display().to_string(),
            "--run-id".to_string(),
            self.run_id.clone(),
            "--max-minutes".to_string(),
            format_number(self.max_run.as_secs_f64() / 60.0),
        ];
        if self.framework != Framework::Auto {
            args.extend(["--framework".to_string(), self.framework.to_string()]);
        }
        if let Some(every) = self.checkpoint_every {
            args.extend([
                "--checkpoint-every-seconds".to_string(),
                every.as_secs().to_string(),
            ]);
        }
        if let Some(path) = resume_from {
            args.extend(["--resume-from".to_string(), path.to_string()]);
        }
        args
    }
}

fn minutes(value: f64) -> Duration {
    Duration::try_from_secs_f64(value * 60.0).unwrap_or_default()
}

/// Render `10.0` as `10` and `2.5` as `2.5`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

/// `run-<epoch millis>`.
#[must_use]
pub fn default_run_id() -> String {
    format!("run-{}", now_millis())
}

/// Latest `{step, loss}` reported by the job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub step: u64,
    pub loss: f64,
}

/// Structured line on the job's stdout.
#[derive(Debug, Clone, PartialEq)]
enum JobEvent {
    Progress(ProgressUpdate),
    CheckpointSaved(String),
}

impl JobEvent {
    /// `None` for anything that is not a recognized JSON event.
    fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        let obj = value.as_object()?;

        if obj.get("event").and_then(|e| e.as_str()) == Some("checkpoint_saved") {
            let path = obj.get("path")?.as_str()?;
            return Some(Self::CheckpointSaved(path.to_string()));
        }

        let step = obj.get("step")?;
        let step = step.as_u64().or_else(|| {
            step.as_f64()
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(|s| s.round() as u64)
        })?;
        let loss = obj.get("loss")?.as_f64()?;
        Some(Self::Progress(ProgressUpdate { step, loss }))
    }
}

/// Classification of a finished run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Non-zero exit, or death by a signal other than `SIGINT`/`SIGKILL`.
    Error,
    Timeboxed,
    Stopped,
    SpawnError,
    GovernorRejected,
    ScriptUnavailable,
}

impl RunOutcome {
    /// Intentional termination counts as success.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Timeboxed | Self::Stopped)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Timeboxed => "timeboxed",
            Self::Stopped => "stopped",
            Self::SpawnError => "spawn_error",
            Self::GovernorRejected => "governor_rejected",
            Self::ScriptUnavailable => "script_unavailable",
        }
    }

    fn record_status(self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Timeboxed => RunStatus::Timeboxed,
            Self::Stopped => RunStatus::Stopped,
            Self::Error | Self::SpawnError | Self::GovernorRejected | Self::ScriptUnavailable => {
                RunStatus::Failed
            }
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`Supervisor::run`].
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    /// `None` when the job never ran or was ended by a signal.
    pub exit_code: Option<i32>,
    /// Rejection reason, environment error, or captured stderr. Only set
    /// for failures.
    pub error: Option<String>,
    pub duration: Duration,
    pub reason: RunOutcome,
    pub last_progress: Option<ProgressUpdate>,
}

impl RunResult {
    fn not_started(run_id: String, reason: RunOutcome, error: String, started: Instant) -> Self {
        Self {
            run_id,
            success: false,
            exit_code: None,
            error: Some(error),
            duration: started.elapsed(),
            reason,
            last_progress: None,
        }
    }
}

/// Requests a graceful stop of the supervised job. Cloneable and idempotent.
/// A stop only applies to the attempt in flight: [`Supervisor::run`] clears
/// it when the next attempt starts.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Why the escalation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Timebox,
    Stop,
}

impl Escalation {
    fn outcome(self) -> RunOutcome {
        match self {
            Self::Timebox => RunOutcome::Timeboxed,
            Self::Stop => RunOutcome::Stopped,
        }
    }
}

/// Runs jobs one at a time behind a [`Governor`], recording them in a
/// [`RunStore`].
pub struct Supervisor {
    settings: RunSettings,
    governor: Governor,
    store: RunStore,
    stop_tx: Arc<watch::Sender<bool>>,
    progress_tx: watch::Sender<Option<ProgressUpdate>>,
}

impl Supervisor {
    /// `store` should already be initialized.
    #[must_use]
    pub fn new(settings: RunSettings, governor: Governor, store: RunStore) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (progress_tx, _) = watch::channel(None);
        Self {
            settings,
            governor,
            store,
            stop_tx: Arc::new(stop_tx),
            progress_tx,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut RunSettings {
        &mut self.settings
    }

    pub fn governor_mut(&mut self) -> &mut Governor {
        &mut self.governor
    }

    #[must_use]
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Live view of the latest progress event.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Option<ProgressUpdate>> {
        self.progress_tx.subscribe()
    }

    /// Admit, launch and supervise the configured job to a terminal state.
    ///
    /// Rejections and environment errors are reported through the result,
    /// never as a panic or `Err`. The record is persisted before returning.
    pub async fn run(&mut self) -> RunResult {
        let started = Instant::now();
        let run_id = self.settings.run_id.clone();
        self.progress_tx.send_replace(None);
        self.stop_tx.send_replace(false);

        let decision = self.governor.can_start_run().await;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_default();
            tracing::warn!(run_id = %run_id, "admission rejected: {reason}");
            return RunResult::not_started(run_id, RunOutcome::GovernorRejected, reason, started);
        }
        tracing::info!(run_id = %run_id, "admission granted");

        if let Err(e) = tokio::fs::File::open(&self.settings.script).await {
            let error = format!(
                "script {} is not readable: {e}",
                self.settings.script.display()
            );
            tracing::error!(run_id = %run_id, "{error}");
            return RunResult::not_started(run_id, RunOutcome::ScriptUnavailable, error, started);
        }

        let mut record = match self.begin_record().await {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(run_id = %run_id, "{error}");
                return RunResult::not_started(
                    run_id,
                    RunOutcome::ScriptUnavailable,
                    error,
                    started,
                );
            }
        };

        let resume_from = self
            .settings
            .resume_from
            .clone()
            .or_else(|| record.latest_checkpoint().map(String::from));
        if self.settings.resume_from.is_none()
            && let Some(path) = &resume_from
        {
            tracing::info!(run_id = %run_id, checkpoint = %path, "auto-resuming from latest checkpoint");
        }

        let exited = match self.supervise(&mut record, resume_from.as_deref()).await {
            Ok(exited) => exited,
            Err(e) => {
                let error = format!("failed to spawn {}: {e}", self.settings.interpreter);
                tracing::error!(run_id = %run_id, "{error}");
                self.finish(&mut record, RunOutcome::SpawnError).await;
                return RunResult::not_started(run_id, RunOutcome::SpawnError, error, started);
            }
        };

        let (reason, exit_code, error) = match exited.status {
            Ok(status) => {
                let reason = classify(status, exited.escalation);
                let error =
                    (!reason.is_success()).then(|| failure_text(status, &exited.stderr_tail));
                (reason, status.code(), error)
            }
            Err(e) => (
                RunOutcome::Error,
                None,
                Some(format!("failed to wait for job: {e}")),
            ),
        };

        self.finish(&mut record, reason).await;
        tracing::info!(run_id = %run_id, reason = %reason, ?exit_code, "run finished");

        RunResult {
            run_id,
            success: reason.is_success(),
            exit_code,
            error,
            duration: started.elapsed(),
            reason,
            last_progress: *self.progress_tx.borrow(),
        }
    }

    /// Load or create the record for this run id and mark it running.
    async fn begin_record(&mut self) -> Result<RunRecord, String> {
        let script = self.settings.script.display().to_string();
        let record = match self.store.get_run(&self.settings.run_id) {
            Some(existing) if existing.script_path != script => {
                return Err(format!(
                    "run id {} already belongs to script {}",
                    existing.id, existing.script_path
                ));
            }
            Some(existing) => {
                let mut record = existing.clone();
                record.begin_attempt();
                if self.settings.name.is_some() {
                    record.name.clone_from(&self.settings.name);
                }
                record
            }
            None => RunRecord::new(&self.settings.run_id, self.settings.name.clone(), script),
        };
        self.save(&record).await;
        Ok(record)
    }

    /// Spawn the job and drive it until it exits.
    ///
    /// Returns `Err` only if the process could not be spawned.
    async fn supervise(
        &mut self,
        record: &mut RunRecord,
        resume_from: Option<&str>,
    ) -> std::io::Result<Exited> {
        let args = self.settings.job_args(resume_from);
        tracing::debug!("spawning: {} {}", self.settings.interpreter, args.join(" "));

        let mut cmd = Command::new(&self.settings.interpreter);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches the job only through
        // the StopHandle, so it is recorded as a stop.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("job exited before its PID was read"))?;
        tracing::info!(run_id = %record.id, pid, "job started");

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = LossyLines::new(stderr);
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            })
        });

        let mut stdout = child.stdout.take().map(LossyLines::new);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut stop_closed = false;

        let timebox = tokio::time::sleep(self.settings.max_run);
        let grace = tokio::time::sleep(self.settings.grace);
        tokio::pin!(timebox, grace);

        let mut escalation: Option<Escalation> = None;
        let mut killed = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                line = next_line(&mut stdout) => match line {
                    Some(line) => self.handle_line(&line, record).await,
                    None => stdout = None,
                },
                () = &mut timebox, if escalation.is_none() => {
                    tracing::warn!(run_id = %record.id, pid, signal = "SIGINT", "timebox reached, interrupting job");
                    escalation = Some(Escalation::Timebox);
                    send_signal(pid, Signal::Interrupt);
                    grace.as_mut().reset(tokio::time::Instant::now() + self.settings.grace);
                }
                requested = async { stop_rx.wait_for(|stop| *stop).await.map(|_| ()) },
                    if escalation.is_none() && !stop_closed =>
                {
                    if requested.is_err() {
                        stop_closed = true;
                        continue;
                    }
                    tracing::warn!(run_id = %record.id, pid, signal = "SIGINT", "stop requested, interrupting job");
                    escalation = Some(Escalation::Stop);
                    send_signal(pid, Signal::Interrupt);
                    grace.as_mut().reset(tokio::time::Instant::now() + self.settings.grace);
                }
                () = &mut grace, if escalation.is_some() && !killed => {
                    tracing::warn!(run_id = %record.id, pid, signal = "SIGKILL", "job ignored interrupt, killing");
                    send_signal(pid, Signal::Kill);
                    killed = true;
                }
            }
        };

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(line) = next_line(&mut stdout).await {
                self.handle_line(&line, record).await;
            }
        })
        .await;

        let stderr_tail = match stderr_task {
            Some(task) => match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(tail)) => tail,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };

        Ok(Exited {
            status,
            escalation,
            stderr_tail,
        })
    }

    async fn handle_line(&mut self, line: &str, record: &mut RunRecord) {
        match JobEvent::parse(line) {
            Some(JobEvent::Progress(update)) => {
                record.last_step = Some(update.step);
                record.last_loss = Some(update.loss);
                self.progress_tx.send_replace(Some(update));
            }
            Some(JobEvent::CheckpointSaved(path)) => {
                tracing::info!(run_id = %record.id, checkpoint = %path, "checkpoint saved");
                record.append_checkpoint(path);
                self.save(record).await;
            }
            None => tracing::debug!(run_id = %record.id, "job: {line}"),
        }
    }

    async fn finish(&mut self, record: &mut RunRecord, reason: RunOutcome) {
        record.finish(reason.record_status());
        self.save(record).await;
    }

    async fn save(&mut self, record: &RunRecord) {
        if let Err(e) = self.store.save_run_async(record).await {
            tracing::error!(run_id = %record.id, "failed to persist run record: {e}");
        }
    }
}

/// How a spawned job ended.
struct Exited {
    status: std::io::Result<ExitStatus>,
    escalation: Option<Escalation>,
    stderr_tail: Vec<String>,
}

/// Newline-delimited reader that never gives up on bad bytes.
///
/// Invalid UTF-8 is replaced instead of ending the stream, so the pipe stays
/// drained and the job never sees `SIGPIPE`. Cancel safe: a partial line
/// stays buffered until the next call.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// `Ok(None)` at end of stream. A final line without a newline is still
    /// returned.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Next stdout line, or pending forever once the stream is closed so the
/// select loop keeps waiting on the other branches.
async fn next_line(stdout: &mut Option<LossyLines<ChildStdout>>) -> Option<String> {
    let Some(lines) = stdout else {
        return std::future::pending().await;
    };
    match lines.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "job stdout unreadable, ignoring further output");
            None
        }
    }
}

/// Resolve the outcome.
///
/// A job killed by `SIGINT` or `SIGKILL` ended intentionally: `Stopped` if a
/// stop was requested, `Timeboxed` otherwise (including a signal from
/// outside the supervisor). Any exit code is taken at face value, so a job
/// that handles the interrupt and exits 0 completed.
fn classify(status: ExitStatus, escalation: Option<Escalation>) -> RunOutcome {
    if is_intentional_signal(status) {
        return escalation.unwrap_or(Escalation::Timebox).outcome();
    }
    if status.success() {
        RunOutcome::Completed
    } else {
        RunOutcome::Error
    }
}

#[cfg(unix)]
fn is_intentional_signal(status: ExitStatus) -> bool {
    matches!(terminating_signal(status), Some(libc::SIGINT | libc::SIGKILL))
}

#[cfg(not(unix))]
fn is_intentional_signal(_status: ExitStatus) -> bool {
    false
}

fn failure_text(status: ExitStatus, stderr_tail: &[String]) -> String {
    if !stderr_tail.is_empty() {
        return stderr_tail.join("\n");
    }
    match (status.code(), terminating_signal(status)) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => status.to_string(),
    }
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child is only reaped by `wait`, which ends the select
    // loop, so the PID still refers to our child (possibly a zombie).
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc != 0 {
        tracing::debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "signal not delivered");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    tracing::warn!(pid, ?signal, "signals are not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_event() {
        assert_eq!(
            JobEvent::parse(r#"{"step": 12, "loss": 0.5}"#),
            Some(JobEvent::Progress(ProgressUpdate { step: 12, loss: 0.5 }))
        );
        assert_eq!(
            JobEvent::parse(r#"{"step": 3.0, "loss": 1}"#),
            Some(JobEvent::Progress(ProgressUpdate { step: 3, loss: 1.0 }))
        );
    }

    #[test]
    fn test_parse_checkpoint_event() {
        assert_eq!(
            JobEvent::parse(r#"{"event": "checkpoint_saved", "path": "ckpt/3.pt"}"#),
            Some(JobEvent::CheckpointSaved("ckpt/3.pt".into()))
        );
        assert_eq!(JobEvent::parse(r#"{"event": "checkpoint_saved"}"#), None);
    }

    #[test]
    fn test_opaque_lines() {
        assert_eq!(JobEvent::parse("Epoch 1/10"), None);
        assert_eq!(JobEvent::parse(r#"{"step": "x", "loss": 1}"#), None);
        assert_eq!(JobEvent::parse(r#"{"loss": 1}"#), None);
        assert_eq!(JobEvent::parse("[1, 2]"), None);
    }

    #[test]
    fn test_job_args() {
        let mut settings = RunSettings::new("train.py", "exp-1");
        assert_eq!(
            settings.job_args(None),
            ["train.py", "--run-id", "exp-1", "--max-minutes", "10"]
        );

        settings.framework = Framework::Pytorch;
        settings.max_run = Duration::from_secs(90);
        settings.checkpoint_every = Some(Duration::from_secs(120));
        assert_eq!(
            settings.job_args(Some("ckpt/a.pt")),
            [
                "train.py",
                "--run-id",
                "exp-1",
                "--max-minutes",
                "1.5",
                "--framework",
                "pytorch",
                "--checkpoint-every-seconds",
                "120",
                "--resume-from",
                "ckpt/a.pt",
            ]
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = HarnessConfig::default();
        config.run.script = "train.py".into();
        config.run.checkpoint_every_minutes = Some(2.0);
        let settings = RunSettings::from_config(&config);
        assert!(settings.run_id.starts_with("run-"));
        assert_eq!(settings.max_run, Duration::from_secs(600));
        assert_eq!(settings.checkpoint_every, Some(Duration::from_secs(120)));
        assert_eq!(settings.grace, Duration::from_secs(30));
    }

    #[test]
    fn test_outcome_success_and_names() {
        assert!(RunOutcome::Timeboxed.is_success());
        assert!(RunOutcome::Stopped.is_success());
        assert!(!RunOutcome::SpawnError.is_success());
        assert_eq!(RunOutcome::GovernorRejected.to_string(), "governor_rejected");
        assert_eq!(
            serde_json::to_value(RunOutcome::SpawnError).unwrap(),
            "spawn_error"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_classify() {
        use std::os::unix::process::ExitStatusExt;

        let ok = ExitStatus::from_raw(0);
        let failed = ExitStatus::from_raw(1 << 8);
        let interrupted = ExitStatus::from_raw(libc::SIGINT);
        let killed = ExitStatus::from_raw(libc::SIGKILL);

        let terminated = ExitStatus::from_raw(libc::SIGTERM);

        assert_eq!(classify(ok, None), RunOutcome::Completed);
        assert_eq!(classify(failed, None), RunOutcome::Error);
        assert_eq!(classify(terminated, None), RunOutcome::Error);

        // Interrupt or kill from anywhere is an intentional stop.
        assert_eq!(classify(interrupted, None), RunOutcome::Timeboxed);
        assert_eq!(classify(killed, None), RunOutcome::Timeboxed);
        assert_eq!(
            classify(interrupted, Some(Escalation::Timebox)),
            RunOutcome::Timeboxed
        );
        assert_eq!(classify(killed, Some(Escalation::Stop)), RunOutcome::Stopped);

        // Exit codes are taken at face value even after an interrupt.
        assert_eq!(classify(ok, Some(Escalation::Timebox)), RunOutcome::Completed);
        assert_eq!(classify(failed, Some(Escalation::Stop)), RunOutcome::Error);
        assert_eq!(classify(failed, Some(Escalation::Timebox)), RunOutcome::Error);
    }

    #[tokio::test]
    async fn test_lossy_lines_survive_invalid_utf8() {
        let input: &[u8] = b"ok\nbad \xff\xfe bytes\r\n{\"step\": 1, \"loss\": 0.5}\ntail";
        let mut lines = LossyLines::new(input);

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("bad \u{fffd}\u{fffd} bytes")
        );
        let event = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(JobEvent::parse(&event), Some(JobEvent::Progress(_))));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
