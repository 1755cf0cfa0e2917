//! The worker that carries one admitted job through its stages.

use crate::error::PipelineError;
use crate::Shared;
use anyhow::anyhow;
use chrono::Utc;
use rjob_model::{JobRecord, JobResult, ResultStatus, Stage};
use rjob_remote::{shell, RemoteSession, ScriptLaunch};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Progress published once the remote script has returned.
pub(crate) const SCRIPT_RETURNED_PCT: u8 = 70;

/// Why the pipeline stopped before completing.
enum Halt {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        Halt::Failed(err.into())
    }
}

/// What the pipeline learned along the way, kept for finalization and cleanup.
#[derive(Default)]
struct Trail {
    session: Option<Box<dyn RemoteSession>>,
    executing_started: bool,
    downloading_started: bool,
    exit_code: Option<i32>,
    remote_log_path: Option<String>,
    local_artifacts_path: Option<PathBuf>,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    job: JobRecord,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, job: JobRecord) -> Self {
        Self { shared, job }
    }

    pub(crate) async fn run(self) {
        let job_id = self.job.job_id.clone();
        info!(target: "engine::pipeline", job_id = %job_id, "job started");
        let mut trail = Trail::default();
        let outcome = self.stages(&mut trail).await;

        let outcome = match outcome {
            Err(Halt::Failed(err)) if self.cancel_requested() => {
                info!(
                    target: "engine::pipeline",
                    job_id = %job_id,
                    "stage error after cancellation: {err:#}"
                );
                Err(Halt::Cancelled)
            }
            other => other,
        };

        if matches!(outcome, Err(Halt::Cancelled)) {
            self.cleanup_cancelled(&mut trail).await;
        }
        if let Some(session) = trail.session.take() {
            if let Err(err) = session.disconnect().await {
                warn!(target: "engine::pipeline", job_id = %job_id, "disconnect failed: {err:#}");
            }
        }

        let result = match outcome {
            Ok(()) => self.result(
                ResultStatus::Succeeded,
                "job completed successfully".into(),
                &trail,
            ),
            Err(Halt::Cancelled) => {
                let reason = self
                    .shared
                    .state
                    .lock()
                    .current
                    .as_ref()
                    .and_then(|job| job.cancel_reason.clone())
                    .unwrap_or_else(|| "no reason given".into());
                self.result(
                    ResultStatus::Cancelled,
                    format!("job cancelled: {reason}"),
                    &trail,
                )
            }
            Err(Halt::Failed(err)) => {
                let stage = self.current_stage();
                error!(
                    target: "engine::pipeline",
                    job_id = %job_id,
                    stage = %stage,
                    "job failed: {err:#}"
                );
                let mut result = self.result(
                    ResultStatus::Failed,
                    format!("job failed during {stage}"),
                    &trail,
                );
                result.error = Some(err.to_string());
                result.traceback = Some(format!("{err:?}"));
                if result.exit_code.is_none() {
                    result.exit_code = err
                        .downcast_ref::<PipelineError>()
                        .and_then(PipelineError::exit_code);
                }
                result
            }
        };
        self.shared.finalize(result);
    }

    async fn stages(&self, trail: &mut Trail) -> Result<(), Halt> {
        self.checkpoint()?;
        let settings = self
            .shared
            .settings
            .load()
            .map_err(PipelineError::ConfigurationMissing)?;
        self.checkpoint()?;

        let layout = &self.shared.layout;
        let job_id = &self.job.job_id;
        let remote_dir = layout.remote_job_dir(job_id);

        // uploading
        self.enter(Stage::Uploading, 10)?;
        let session = self
            .shared
            .connector
            .connect(&settings)
            .await
            .map_err(|source| PipelineError::Connect {
                host: settings.host.clone(),
                source,
            })?;
        let session = trail.session.insert(session);
        self.publish(None, 20);
        let uploaded = session
            .upload_directory(&self.job.work_dir, &remote_dir, &layout.upload_excludes())
            .await
            .map_err(|source| PipelineError::Transfer {
                what: "upload",
                source,
            })?;
        info!(target: "engine::pipeline", job_id = %job_id, "uploaded {uploaded} files to {remote_dir}");
        self.publish(None, 40);
        self.checkpoint()?;

        // executing
        self.enter(Stage::Executing, 50)?;
        trail.executing_started = true;
        let relative = self
            .job
            .script_path
            .strip_prefix(&self.job.work_dir)
            .ok()
            .and_then(shell::relative_posix)
            .ok_or_else(|| {
                Halt::Failed(anyhow!(
                    "script {} is not inside {}",
                    self.job.script_path.display(),
                    self.job.work_dir.display()
                ))
            })?;
        let log_path = layout.remote_log(job_id);
        trail.remote_log_path = Some(session.expand_path(&log_path));
        let launch = ScriptLaunch {
            script_path: shell::join(&remote_dir, &relative),
            working_dir: remote_dir.clone(),
            log_path,
            pid_file: Some(layout.remote_pid_file(job_id)),
            env: vec![("PYTHONPATH".into(), ".".into())],
        };
        let output = session
            .execute_script(&launch)
            .await
            .map_err(|source| PipelineError::ConnectionLost {
                host: session.host().to_string(),
                source,
            })?;
        trail.exit_code = Some(output.exit_code);
        self.publish(None, SCRIPT_RETURNED_PCT);
        self.checkpoint()?;
        if !output.success() {
            return Err(PipelineError::RemoteExecution {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }
            .into());
        }
        if let Err(err) = session.remove_path(&layout.remote_pid_file(job_id)).await {
            warn!(target: "engine::pipeline", job_id = %job_id, "could not remove pid file: {err:#}");
        }
        self.checkpoint()?;

        // downloading
        self.enter(Stage::Downloading, 80)?;
        trail.downloading_started = true;
        let local = layout.local_artifacts(&self.job.work_dir, job_id);
        let downloaded = session
            .download_directory(&remote_dir, &local, true)
            .await
            .map_err(|source| PipelineError::Transfer {
                what: "download",
                source,
            })?;
        trail.local_artifacts_path = Some(local);
        info!(target: "engine::pipeline", job_id = %job_id, "downloaded {downloaded} files");
        self.publish(None, 90);
        self.checkpoint()?;

        // finalizing
        self.enter(Stage::Finalizing, 95)?;
        if let Some(session) = trail.session.take() {
            if let Err(err) = session.disconnect().await {
                warn!(target: "engine::pipeline", job_id = %job_id, "disconnect failed: {err:#}");
            }
        }
        self.publish(None, 100);
        Ok(())
    }

    /// Best-effort removal of whatever the cancelled job left half done.
    async fn cleanup_cancelled(&self, trail: &mut Trail) {
        let layout = &self.shared.layout;
        let job_id = &self.job.job_id;
        if let Some(session) = trail.session.as_deref() {
            let target = if trail.executing_started {
                layout.remote_pid_file(job_id)
            } else {
                layout.remote_job_dir(job_id)
            };
            if let Err(err) = session.remove_path(&target).await {
                warn!(target: "engine::pipeline", job_id = %job_id, "cleanup of {target} failed: {err:#}");
            }
        }
        if trail.downloading_started {
            let local = layout.local_artifacts(&self.job.work_dir, job_id);
            if local.exists() {
                if let Err(err) = tokio::fs::remove_dir_all(&local).await {
                    warn!(
                        target: "engine::pipeline",
                        job_id = %job_id,
                        "cleanup of {} failed: {err}",
                        local.display()
                    );
                }
            }
            trail.local_artifacts_path = None;
        }
    }

    fn result(&self, status: ResultStatus, message: String, trail: &Trail) -> JobResult {
        JobResult {
            job_id: self.job.job_id.clone(),
            status,
            message,
            error: None,
            traceback: None,
            exit_code: trail.exit_code,
            remote_log_path: trail.remote_log_path.clone(),
            local_artifacts_path: trail.local_artifacts_path.clone(),
            started_at: self.job.started_at,
            ended_at: Utc::now(),
        }
    }

    fn cancel_requested(&self) -> bool {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|job| job.job_id == self.job.job_id && job.cancel_requested)
    }

    fn current_stage(&self) -> Stage {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|job| job.stage)
            .unwrap_or(Stage::Initializing)
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if self.cancel_requested() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Moves the job into `stage` unless cancellation was already requested.
    /// The check and the advance happen under one lock, so a concurrent
    /// terminate either sees the new stage or stops the worker here.
    fn enter(&self, stage: Stage, progress_pct: u8) -> Result<(), Halt> {
        {
            let mut state = self.shared.state.lock();
            if let Some(job) = state
                .current
                .as_mut()
                .filter(|job| job.job_id == self.job.job_id && job.is_active())
            {
                if job.cancel_requested {
                    return Err(Halt::Cancelled);
                }
                job.advance(Some(stage), Some(progress_pct));
            }
        }
        info!(target: "engine::pipeline", job_id = %self.job.job_id, "stage {stage}");
        Ok(())
    }

    fn publish(&self, stage: Option<Stage>, progress_pct: u8) {
        let mut state = self.shared.state.lock();
        if let Some(job) = state
            .current
            .as_mut()
            .filter(|job| job.job_id == self.job.job_id && job.is_active())
        {
            job.advance(stage, Some(progress_pct));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobLayout, State};
    use parking_lot::Mutex;
    use rjob_model::new_job_id;
    use rjob_remote::config::StaticSettings;
    use rjob_remote::mock::MockHost;
    use std::time::Duration;

    fn worker(cancel_requested: bool) -> Worker {
        let mut job = JobRecord::new(new_job_id(), "/w/main.py".into(), "/w".into());
        job.advance(Some(Stage::Uploading), Some(40));
        job.cancel_requested = cancel_requested;
        let shared = Arc::new(crate::Shared {
            state: Mutex::new(State {
                current: Some(job.clone()),
                last_result: None,
            }),
            connector: Arc::new(MockHost::new("/nonexistent")),
            settings: Arc::new(StaticSettings(MockHost::settings())),
            layout: JobLayout::default(),
            pid_poll: Duration::from_millis(10),
        });
        Worker::new(shared, job)
    }

    fn observed(worker: &Worker) -> (Stage, u8) {
        let state = worker.shared.state.lock();
        let job = state.current.as_ref().expect("job");
        (job.stage, job.progress_pct)
    }

    #[test]
    fn flagged_job_never_reaches_executing() {
        let worker = worker(true);
        assert!(matches!(worker.enter(Stage::Executing, 50), Err(Halt::Cancelled)));
        assert_eq!(observed(&worker), (Stage::Uploading, 40));
        assert!(!worker.shared.script_pending(&worker.job.job_id));
    }

    #[test]
    fn entering_executing_marks_script_pending() {
        let worker = worker(false);
        assert!(worker.enter(Stage::Executing, 50).is_ok());
        assert_eq!(observed(&worker), (Stage::Executing, 50));
        assert!(worker.shared.script_pending(&worker.job.job_id));
        worker.publish(None, SCRIPT_RETURNED_PCT);
        assert!(!worker.shared.script_pending(&worker.job.job_id));
    }
}
