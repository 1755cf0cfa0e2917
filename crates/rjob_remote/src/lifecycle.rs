//! Remote process lifecycle: launching a script as a tracked session leader and
//! tearing its process group down again with a TERM-then-KILL escalation.

use crate::{config, shell, RemoteShell, ScriptLaunch};
use async_trait::async_trait;
use rjob_model::TerminationOutcome;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pid file {0} not found")]
    PidFileNotFound(String),
    #[error("pid file {path} holds an invalid pid: {content:?}")]
    InvalidPid { path: String, content: String },
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

/// The primitive operations the escalation protocol needs from a host.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn read_pid(&self, pid_file: &str) -> Result<u32, LifecycleError>;

    /// Process group of `pid`, or `None` when the process no longer exists.
    async fn process_group(&self, pid: u32) -> anyhow::Result<Option<u32>>;

    async fn signal_group(&self, pgid: u32, signal: Signal) -> anyhow::Result<()>;

    /// Whether any member of the process group is still alive.
    async fn group_alive(&self, pgid: u32) -> anyhow::Result<bool>;
}

pub fn parse_pid(path: &str, content: &str) -> Result<u32, LifecycleError> {
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(LifecycleError::InvalidPid {
            path: path.to_string(),
            content: content.trim().to_string(),
        }),
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct ProcessController<P> {
    control: P,
    poll_interval: Duration,
}

impl<P: ProcessControl> ProcessController<P> {
    pub fn new(control: P) -> Self {
        Self {
            control,
            poll_interval: config::poll_interval().max(MIN_POLL_INTERVAL),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Terminates the process group whose leader PID is recorded in `pid_file`.
    ///
    /// SIGTERM goes to the whole group first; liveness is polled until `grace`
    /// elapses, after which the group receives SIGKILL. The call returns after at
    /// most `grace` plus one poll interval (plus command round-trips).
    pub async fn terminate(
        &self,
        pid_file: &str,
        grace: Duration,
    ) -> Result<TerminationOutcome, LifecycleError> {
        let pid = self.control.read_pid(pid_file).await?;
        let Some(pgid) = self.control.process_group(pid).await? else {
            info!(target: "remote::lifecycle", "pid {pid} already exited");
            return Ok(TerminationOutcome::AlreadyExited);
        };

        info!(target: "remote::lifecycle", "sending SIGTERM to process group {pgid}");
        self.control.signal_group(pgid, Signal::Term).await?;

        let deadline = Instant::now() + grace;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
            if !self.control.group_alive(pgid).await? {
                info!(target: "remote::lifecycle", "process group {pgid} exited after SIGTERM");
                return Ok(TerminationOutcome::TerminatedGracefully);
            }
        }

        warn!(
            target: "remote::lifecycle",
            "process group {pgid} survived {:?} grace window, sending SIGKILL",
            grace
        );
        self.control.signal_group(pgid, Signal::Kill).await?;
        sleep(self.poll_interval).await;
        if self.control.group_alive(pgid).await? {
            warn!(target: "remote::lifecycle", "process group {pgid} still alive after SIGKILL");
            Ok(TerminationOutcome::TerminationUnconfirmed)
        } else {
            Ok(TerminationOutcome::TerminatedForcefully)
        }
    }
}

/// [`ProcessControl`] over plain shell commands (`cat`, `ps`, `kill`).
pub struct ShellProcessControl<'a, S: ?Sized> {
    shell: &'a S,
}

impl<'a, S: RemoteShell + ?Sized> ShellProcessControl<'a, S> {
    pub fn new(shell: &'a S) -> Self {
        Self { shell }
    }
}

const MISSING_MARKER: &str = "__rjob_missing__";

#[async_trait]
impl<S: RemoteShell + ?Sized> ProcessControl for ShellProcessControl<'_, S> {
    async fn read_pid(&self, pid_file: &str) -> Result<u32, LifecycleError> {
        let quoted = shell::quote(pid_file);
        let out = self
            .shell
            .exec(&format!(
                "test -f {quoted} && cat {quoted} || echo {MISSING_MARKER}"
            ))
            .await?;
        if out.stdout.trim() == MISSING_MARKER {
            return Err(LifecycleError::PidFileNotFound(pid_file.to_string()));
        }
        parse_pid(pid_file, &out.stdout)
    }

    async fn process_group(&self, pid: u32) -> anyhow::Result<Option<u32>> {
        let out = self
            .shell
            .exec(&format!("ps -o pgid= -p {pid} 2>/dev/null || true"))
            .await?;
        let raw = out.stdout.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u32>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("unexpected pgid output for pid {pid}: {raw:?}"))
    }

    async fn signal_group(&self, pgid: u32, signal: Signal) -> anyhow::Result<()> {
        self.shell
            .exec(&format!("kill -{} -- -{pgid} 2>/dev/null || true", signal.name()))
            .await?;
        Ok(())
    }

    async fn group_alive(&self, pgid: u32) -> anyhow::Result<bool> {
        let out = self
            .shell
            .exec(&format!(
                "kill -0 -- -{pgid} 2>/dev/null && echo alive || echo dead"
            ))
            .await?;
        Ok(out.stdout.trim() == "alive")
    }
}

/// Builds the command line that runs `launch` with `interpreter`.
///
/// With a PID file the script runs under `setsid`; the new session leader writes
/// its own PID before exec'ing the interpreter, and the outer shell `wait`s so the
/// channel reports the script's real exit status.
pub fn launch_command(interpreter: &str, launch: &ScriptLaunch) -> String {
    let script = shell::quote(&launch.script_path);
    let log = shell::quote(&launch.log_path);
    let workdir = shell::quote(&launch.working_dir);
    let env: String = launch
        .env
        .iter()
        .map(|(key, value)| format!("{key}={} ", shell::quote(value)))
        .collect();

    match &launch.pid_file {
        Some(pid_file) => {
            let pid = shell::quote(pid_file);
            format!(
                "mkdir -p \"$(dirname {pid})\" \"$(dirname {log})\" && cd {workdir} && rm -f {pid} && \
                 {{ {env}setsid sh -c 'printf %s \"$$\" > \"$1\"; shift; exec \"$@\"' rjob-launch {pid} \
                 {interpreter} {script} >> {log} 2>&1 < /dev/null & child=$!; wait \"$child\"; }}"
            )
        }
        None => format!(
            "mkdir -p \"$(dirname {log})\" && cd {workdir} && {env}{interpreter} {script} > {log} 2>&1 < /dev/null"
        ),
    }
}
