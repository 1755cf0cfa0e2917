mod error;
pub mod layout;
mod pipeline;

pub use error::PipelineError;
pub use layout::JobLayout;

use chrono::Utc;
use parking_lot::Mutex;
use pipeline::Worker;
use rjob_model::{
    new_job_id, JobRecord, JobResult, OrchestratorStatus, RejectReason, ResultSnapshot,
    ResultStatus, Stage, StatusSnapshot, SubmitResponse, TerminateResponse, TerminationOutcome,
};
use rjob_remote::config::{self, SettingsProvider};
use rjob_remote::{DynRemoteConnector, LifecycleError, RemoteSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Default)]
pub(crate) struct State {
    pub(crate) current: Option<JobRecord>,
    pub(crate) last_result: Option<JobResult>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    pub(crate) connector: DynRemoteConnector,
    pub(crate) settings: Arc<dyn SettingsProvider>,
    pub(crate) layout: JobLayout,
    /// How often a control session looks for a PID file that is not written yet.
    pub(crate) pid_poll: Duration,
}

impl Shared {
    /// Whether `job_id` is executing and its script has not returned yet.
    pub(crate) fn script_pending(&self, job_id: &str) -> bool {
        self.state.lock().current.as_ref().is_some_and(|job| {
            job.job_id == job_id
                && job.is_active()
                && job.stage == Stage::Executing
                && job.progress_pct < pipeline::SCRIPT_RETURNED_PCT
        })
    }

    /// Records `result` and ends the matching job record in one step.
    /// A result for a job that is no longer current, or already ended, is dropped.
    pub(crate) fn finalize(&self, result: JobResult) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state
            .current
            .as_mut()
            .filter(|job| job.job_id == result.job_id && job.is_active())
        else {
            return false;
        };
        job.ended_at = Some(result.ended_at);
        if result.status == ResultStatus::Succeeded {
            job.advance(None, Some(100));
        }
        info!(
            target: "engine::pipeline",
            job_id = %result.job_id,
            status = ?result.status,
            "job finished"
        );
        state.last_result = Some(result);
        true
    }
}

/// Single-flight job orchestrator. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(connector: DynRemoteConnector, settings: Arc<dyn SettingsProvider>) -> Self {
        Self::with_layout(connector, settings, JobLayout::default())
    }

    pub fn with_layout(
        connector: DynRemoteConnector,
        settings: Arc<dyn SettingsProvider>,
        layout: JobLayout,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                connector,
                settings,
                layout,
                pid_poll: config::poll_interval(),
            }),
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.shared.layout
    }

    /// Admits a job if nothing is running and the inputs are valid, then starts its
    /// worker. Must be called from within a Tokio runtime.
    pub fn submit(&self, script_path: impl AsRef<Path>, work_dir: impl AsRef<Path>) -> SubmitResponse {
        let mut state = self.shared.state.lock();
        if let Some(job) = state.current.as_ref().filter(|job| job.is_active()) {
            return SubmitResponse::rejected(
                RejectReason::Busy,
                format!("job {} is still running", job.job_id),
            );
        }
        let (script_path, work_dir) =
            match validate_inputs(script_path.as_ref(), work_dir.as_ref()) {
                Ok(paths) => paths,
                Err(message) => return SubmitResponse::rejected(RejectReason::InvalidInput, message),
            };

        let job = JobRecord::new(new_job_id(), script_path, work_dir);
        let job_id = job.job_id.clone();
        state.current = Some(job.clone());

        let worker = tokio::spawn(Worker::new(self.shared.clone(), job).run());
        let shared = self.shared.clone();
        let supervised_id = job_id.clone();
        tokio::spawn(async move {
            if let Err(join_err) = worker.await {
                error!(target: "engine::pipeline", job_id = %supervised_id, "worker aborted: {join_err}");
                let err = anyhow::Error::from(PipelineError::WorkerPanicked(join_err.to_string()));
                let started_at = shared
                    .state
                    .lock()
                    .current
                    .as_ref()
                    .map(|job| job.started_at)
                    .unwrap_or_else(Utc::now);
                shared.finalize(JobResult {
                    job_id: supervised_id,
                    status: ResultStatus::Failed,
                    message: "job worker stopped unexpectedly".into(),
                    error: Some(err.to_string()),
                    traceback: Some(format!("{err:?}")),
                    exit_code: None,
                    remote_log_path: None,
                    local_artifacts_path: None,
                    started_at,
                    ended_at: Utc::now(),
                });
            }
        });
        drop(state);

        info!(target: "engine::pipeline", job_id = %job_id, "job admitted");
        SubmitResponse::accepted(job_id)
    }

    pub fn get_status(&self) -> StatusSnapshot {
        let state = self.shared.state.lock();
        let status = derive_status(&state);
        let message = match (status, state.current.as_ref()) {
            (OrchestratorStatus::Idle, _) => "no job has been submitted".to_string(),
            (OrchestratorStatus::Running, Some(job)) if job.cancel_requested => format!(
                "job {} is being cancelled ({}, {}%)",
                job.job_id, job.stage, job.progress_pct
            ),
            (OrchestratorStatus::Running, Some(job)) => {
                format!("job {} is {} ({}%)", job.job_id, job.stage, job.progress_pct)
            }
            _ => state
                .last_result
                .as_ref()
                .map(|result| result.message.clone())
                .unwrap_or_default(),
        };
        StatusSnapshot {
            status,
            message,
            job: state.current.clone(),
        }
    }

    pub fn get_last_result(&self) -> ResultSnapshot {
        match self.shared.state.lock().last_result.clone() {
            Some(result) => ResultSnapshot::of(result),
            None => ResultSnapshot::unavailable(),
        }
    }

    /// Flags the running job as cancelled and tears down its remote process group.
    ///
    /// Returns once the termination protocol has finished; the job itself is
    /// finalized as `cancelled` by its worker.
    pub async fn terminate_current_task(&self, reason: &str, grace_seconds: u64) -> TerminateResponse {
        let (job_id, stage) = {
            let mut state = self.shared.state.lock();
            let Some(job) = state.current.as_mut().filter(|job| job.is_active()) else {
                return TerminateResponse::not_running();
            };
            if job.cancel_requested {
                return TerminateResponse {
                    accepted: true,
                    reason: None,
                    message: format!("termination of job {} already in progress", job.job_id),
                    outcome: None,
                    warning: None,
                };
            }
            job.cancel_requested = true;
            job.cancel_reason = Some(reason.to_string());
            (job.job_id.clone(), job.stage)
        };
        info!(target: "engine::pipeline", job_id = %job_id, "cancellation requested: {reason}");

        if stage < Stage::Executing {
            return TerminateResponse {
                accepted: true,
                reason: None,
                message: format!("job {job_id} will stop before its script starts"),
                outcome: None,
                warning: None,
            };
        }

        let grace = Duration::from_secs(grace_seconds);
        match self.signal_remote(&job_id, grace).await {
            Ok(outcome) => {
                let warning = (!outcome.is_confirmed()).then(|| {
                    format!("process group of job {job_id} may still be running")
                });
                TerminateResponse {
                    accepted: true,
                    reason: None,
                    message: termination_message(&job_id, outcome),
                    outcome: Some(outcome),
                    warning,
                }
            }
            Err(err) => {
                warn!(target: "engine::pipeline", job_id = %job_id, "remote termination failed: {err:#}");
                TerminateResponse {
                    accepted: true,
                    reason: None,
                    message: format!("job {job_id} flagged for cancellation"),
                    outcome: None,
                    warning: Some(format!("could not signal the remote process: {err:#}")),
                }
            }
        }
    }

    async fn signal_remote(&self, job_id: &str, grace: Duration) -> anyhow::Result<TerminationOutcome> {
        let settings = self.shared.settings.load()?;
        let session = self.shared.connector.connect(&settings).await?;
        let outcome = self.terminate_launched(session.as_ref(), job_id, grace).await;
        if let Err(err) = session.disconnect().await {
            warn!(target: "engine::pipeline", job_id = %job_id, "control session disconnect failed: {err:#}");
        }
        outcome
    }

    /// Runs the TERM/KILL escalation against the job's process group.
    ///
    /// The script may still be launching when cancellation arrives, so a missing
    /// PID file is waited for while the worker is inside the script run. The wait
    /// and the escalation share one `grace` budget.
    async fn terminate_launched(
        &self,
        session: &dyn RemoteSession,
        job_id: &str,
        grace: Duration,
    ) -> anyhow::Result<TerminationOutcome> {
        let pid_file = self.shared.layout.remote_pid_file(job_id);
        let deadline = Instant::now() + grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.terminate_by_pid_file(&pid_file, remaining).await {
                Err(LifecycleError::PidFileNotFound(_)) if self.shared.script_pending(job_id) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            target: "engine::pipeline",
                            job_id = %job_id,
                            "script of job {job_id} did not record its pid within {grace:?}"
                        );
                        return Ok(TerminationOutcome::TerminationUnconfirmed);
                    }
                    debug!(target: "engine::pipeline", job_id = %job_id, "pid file not written yet");
                    sleep(self.shared.pid_poll.min(deadline - now)).await;
                }
                Err(LifecycleError::PidFileNotFound(_)) => return Ok(TerminationOutcome::AlreadyExited),
                other => return other.map_err(anyhow::Error::from),
            }
        }
    }
}

fn derive_status(state: &State) -> OrchestratorStatus {
    match (&state.current, &state.last_result) {
        (Some(job), _) if job.is_active() => OrchestratorStatus::Running,
        (_, Some(result)) => result.status.into(),
        _ => OrchestratorStatus::Idle,
    }
}

fn termination_message(job_id: &str, outcome: TerminationOutcome) -> String {
    match outcome {
        TerminationOutcome::AlreadyExited => format!("remote process of job {job_id} had already exited"),
        TerminationOutcome::TerminatedGracefully => {
            format!("remote process of job {job_id} stopped after SIGTERM")
        }
        TerminationOutcome::TerminatedForcefully => {
            format!("remote process of job {job_id} killed after the grace window")
        }
        TerminationOutcome::TerminationUnconfirmed => {
            format!("could not confirm that job {job_id} stopped")
        }
    }
}

/// Canonical `(script, work_dir)` or a message for the caller.
fn validate_inputs(script_path: &Path, work_dir: &Path) -> Result<(PathBuf, PathBuf), String> {
    if !work_dir.is_dir() {
        return Err(format!("work_dir {} is not a directory", work_dir.display()));
    }
    if !script_path.is_file() {
        return Err(format!("script {} does not exist", script_path.display()));
    }
    let work_dir = work_dir
        .canonicalize()
        .map_err(|err| format!("cannot resolve {}: {err}", work_dir.display()))?;
    let script = script_path
        .canonicalize()
        .map_err(|err| format!("cannot resolve {}: {err}", script_path.display()))?;
    if !script.starts_with(&work_dir) {
        return Err(format!(
            "script {} is not inside work_dir {}",
            script.display(),
            work_dir.display()
        ));
    }
    Ok((script, work_dir))
}
