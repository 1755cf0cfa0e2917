//! In-process stand-in for a remote host.
//!
//! `~` maps to a local directory. Scripts are not interpreted; instead their
//! header lines may carry directives of the form `# rjob-mock: key=value`:
//!
//! * `exit=N` exit status (default 0)
//! * `sleep_ms=N` how long the "process" runs
//! * `ignore_term` survive SIGTERM, only SIGKILL stops it
//! * `survive_kill` survive SIGKILL too; the run ends only when `sleep_ms` does
//! * `stdout=text` / `stderr=text` lines written to the log and returned
//! * `write=relative/path` file created under the working directory on success
//! * `drop_connection` the session fails mid-execution

use crate::lifecycle::{parse_pid, LifecycleError, ProcessControl, ProcessController, Signal};
use crate::transfer::{self, TransferFilter};
use crate::{shell, ExecOutput, RemoteConnector, RemoteSession, ScriptLaunch};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rjob_model::{ConnectionSettings, Credential, HostKeyCheck, TerminationOutcome};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

const DIRECTIVE: &str = "# rjob-mock:";
const EXIT_ON_TERM: i32 = 143;
const EXIT_ON_KILL: i32 = 137;
const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Directives {
    exit: i32,
    sleep: Duration,
    ignore_term: bool,
    survive_kill: bool,
    stdout: Vec<String>,
    stderr: Vec<String>,
    writes: Vec<String>,
    drop_connection: bool,
}

fn parse_directives(script: &str) -> Directives {
    let mut directives = Directives::default();
    for line in script.lines() {
        let Some(rest) = line.trim().strip_prefix(DIRECTIVE) else {
            continue;
        };
        let rest = rest.trim();
        let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
        match key.trim() {
            "exit" => directives.exit = value.trim().parse().unwrap_or(1),
            "sleep_ms" => directives.sleep = Duration::from_millis(value.trim().parse().unwrap_or(0)),
            "ignore_term" => directives.ignore_term = true,
            "survive_kill" => directives.survive_kill = true,
            "stdout" => directives.stdout.push(value.to_string()),
            "stderr" => directives.stderr.push(value.to_string()),
            "write" => directives.writes.push(value.trim().to_string()),
            "drop_connection" => directives.drop_connection = true,
            _ => {}
        }
    }
    directives
}

struct MockProcess {
    ignore_term: bool,
    survive_kill: bool,
    exit: Option<i32>,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct HostState {
    processes: Mutex<HashMap<u32, MockProcess>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    next_pid: AtomicU32,
    connections: AtomicUsize,
}

/// Connector whose sessions all share one simulated host.
#[derive(Clone)]
pub struct MockHost {
    root: PathBuf,
    fail_connect: bool,
    state: Arc<HostState>,
}

impl MockHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let state = HostState {
            next_pid: AtomicU32::new(4000),
            ..HostState::default()
        };
        Self {
            root: root.into(),
            fail_connect: false,
            state: Arc::new(state),
        }
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Placeholder settings; the mock ignores credentials.
    pub fn settings() -> ConnectionSettings {
        ConnectionSettings {
            host: "mock".into(),
            port: crate::config::DEFAULT_SSH_PORT,
            credential: Credential::UserPassword {
                username: "mock".into(),
                password: String::new(),
            },
            host_key_check: HostKeyCheck::NoCheck,
            interpreter: crate::config::DEFAULT_INTERPRETER.into(),
        }
    }

    /// Every signal delivered so far, in order.
    pub fn signals_sent(&self) -> Vec<Signal> {
        self.state.signals.lock().iter().map(|(_, signal)| *signal).collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn running_processes(&self) -> usize {
        self.state
            .processes
            .lock()
            .values()
            .filter(|process| process.exit.is_none())
            .count()
    }
}

#[async_trait]
impl RemoteConnector for MockHost {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn RemoteSession>> {
        if self.fail_connect {
            bail!("mock connect to {} refused", settings.host);
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating mock root {}", self.root.display()))?;
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            host: self.clone(),
            label: settings.host.clone(),
        }))
    }
}

pub struct MockSession {
    host: MockHost,
    label: String,
}

impl MockSession {
    fn local(&self, remote: &str) -> PathBuf {
        PathBuf::from(self.expand_path(remote))
    }

    fn finish(&self, pid: Option<u32>, code: i32) -> i32 {
        let Some(pid) = pid else {
            return code;
        };
        let mut processes = self.host.state.processes.lock();
        match processes.get_mut(&pid) {
            Some(process) => *process.exit.get_or_insert(code),
            None => code,
        }
    }

    /// Waits for the simulated run time, returning early with the signal exit
    /// code if the process group is torn down.
    async fn run(&self, pid: Option<u32>, wake: Option<Arc<Notify>>, duration: Duration) -> Option<i32> {
        let (Some(pid), Some(wake)) = (pid, wake) else {
            tokio::time::sleep(duration).await;
            return None;
        };
        let sleeping = tokio::time::sleep(duration);
        tokio::pin!(sleeping);
        loop {
            tokio::select! {
                _ = &mut sleeping => return None,
                _ = wake.notified() => {
                    let exit = self
                        .host
                        .state
                        .processes
                        .lock()
                        .get(&pid)
                        .and_then(|process| process.exit);
                    if exit.is_some() {
                        return exit;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.label
    }

    fn expand_path(&self, path: &str) -> String {
        shell::expand_home(path, &self.host.root.to_string_lossy())
    }

    async fn upload_directory(&self, local: &Path, remote: &str, exclude: &[String]) -> Result<usize> {
        let filter = TransferFilter::new(exclude.iter().cloned());
        let source = local.to_path_buf();
        let tree = tokio::task::spawn_blocking(move || transfer::collect_local_tree(&source, &filter))
            .await
            .context("local tree walk panicked")??;
        let target = self.local(remote);
        tokio::fs::create_dir_all(&target).await?;
        for dir in &tree.dirs {
            tokio::fs::create_dir_all(target.join(dir)).await?;
        }
        for (path, relative) in &tree.files {
            tokio::fs::copy(path, target.join(relative))
                .await
                .with_context(|| format!("uploading {relative}"))?;
        }
        Ok(tree.files.len())
    }

    async fn download_directory(&self, remote: &str, local: &Path, overwrite: bool) -> Result<usize> {
        let source = self.local(remote);
        if !source.is_dir() {
            bail!("remote directory {remote} does not exist");
        }
        transfer::check_local_target(local, overwrite)?;
        let walk_root = source.clone();
        let tree = tokio::task::spawn_blocking(move || {
            transfer::collect_local_tree(&walk_root, &TransferFilter::default())
        })
        .await
        .context("remote tree walk panicked")??;
        tokio::fs::create_dir_all(local).await?;
        for dir in &tree.dirs {
            tokio::fs::create_dir_all(local.join(dir)).await?;
        }
        for (path, relative) in &tree.files {
            tokio::fs::copy(path, local.join(relative))
                .await
                .with_context(|| format!("downloading {relative}"))?;
        }
        Ok(tree.files.len())
    }

    async fn execute_script(&self, launch: &ScriptLaunch) -> Result<ExecOutput> {
        let script = self.local(&launch.script_path);
        let workdir = self.local(&launch.working_dir);
        let log_path = self.local(&launch.log_path);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = match tokio::fs::read_to_string(&script).await {
            Ok(source) => source,
            Err(_) => {
                let message = format!("can't open file '{}'", launch.script_path);
                tokio::fs::write(&log_path, format!("{message}\n")).await?;
                return Ok(ExecOutput {
                    exit_code: EXIT_NOT_FOUND,
                    stdout: String::new(),
                    stderr: message,
                });
            }
        };
        let directives = parse_directives(&source);

        let mut pid = None;
        let mut wake = None;
        if let Some(pid_file) = &launch.pid_file {
            let pid_path = self.local(pid_file);
            if let Some(parent) = pid_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let next = self.host.state.next_pid.fetch_add(1, Ordering::SeqCst);
            let notify = Arc::new(Notify::new());
            self.host.state.processes.lock().insert(
                next,
                MockProcess {
                    ignore_term: directives.ignore_term,
                    survive_kill: directives.survive_kill,
                    exit: None,
                    wake: notify.clone(),
                },
            );
            tokio::fs::write(&pid_path, next.to_string()).await?;
            pid = Some(next);
            wake = Some(notify);
        }

        let mut log = String::new();
        for line in directives.stdout.iter().chain(directives.stderr.iter()) {
            log.push_str(line);
            log.push('\n');
        }
        tokio::fs::write(&log_path, &log).await?;

        if let Some(code) = self.run(pid, wake, directives.sleep).await {
            info!(target: "remote::mock", "script {} stopped by signal", launch.script_path);
            return Ok(ExecOutput {
                exit_code: code,
                stdout: directives.stdout.join("\n"),
                stderr: String::new(),
            });
        }
        if directives.drop_connection {
            self.finish(pid, EXIT_ON_KILL);
            return Err(anyhow!("mock connection to {} dropped", self.label));
        }
        if directives.exit == 0 {
            for relative in &directives.writes {
                let target = workdir.join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, format!("written by {}\n", launch.script_path)).await?;
            }
        }
        let code = self.finish(pid, directives.exit);
        Ok(ExecOutput {
            exit_code: code,
            stdout: directives.stdout.join("\n"),
            stderr: directives.stderr.join("\n"),
        })
    }

    async fn terminate_by_pid_file(
        &self,
        pid_file: &str,
        grace: Duration,
    ) -> Result<TerminationOutcome, LifecycleError> {
        let control = MockProcessControl {
            host: &self.host,
            pid_path: self.local(pid_file),
        };
        ProcessController::new(control)
            .with_poll_interval(Duration::from_millis(20))
            .terminate(pid_file, grace)
            .await
    }

    async fn remove_path(&self, remote: &str) -> Result<()> {
        let target = self.local(remote);
        if target == self.host.root {
            bail!("refusing to remove the mock home directory");
        }
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await?,
            Ok(_) => tokio::fs::remove_file(&target).await?,
            Err(_) => {}
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct MockProcessControl<'a> {
    host: &'a MockHost,
    pid_path: PathBuf,
}

#[async_trait]
impl ProcessControl for MockProcessControl<'_> {
    async fn read_pid(&self, pid_file: &str) -> Result<u32, LifecycleError> {
        let content = tokio::fs::read_to_string(&self.pid_path)
            .await
            .map_err(|_| LifecycleError::PidFileNotFound(pid_file.to_string()))?;
        parse_pid(pid_file, &content)
    }

    async fn process_group(&self, pid: u32) -> Result<Option<u32>> {
        let processes = self.host.state.processes.lock();
        Ok(processes
            .get(&pid)
            .filter(|process| process.exit.is_none())
            .map(|_| pid))
    }

    async fn signal_group(&self, pgid: u32, signal: Signal) -> Result<()> {
        self.host.state.signals.lock().push((pgid, signal));
        let mut processes = self.host.state.processes.lock();
        if let Some(process) = processes.get_mut(&pgid) {
            if process.exit.is_some() {
                return Ok(());
            }
            let code = match signal {
                Signal::Term if process.ignore_term => return Ok(()),
                Signal::Term => EXIT_ON_TERM,
                Signal::Kill if process.survive_kill => return Ok(()),
                Signal::Kill => EXIT_ON_KILL,
            };
            process.exit = Some(code);
            process.wake.notify_one();
        }
        Ok(())
    }

    async fn group_alive(&self, pgid: u32) -> Result<bool> {
        let processes = self.host.state.processes.lock();
        Ok(processes
            .get(&pgid)
            .map(|process| process.exit.is_none())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn launch(script: &str, pid_file: Option<&str>) -> ScriptLaunch {
        ScriptLaunch {
            script_path: format!("~/job/{script}"),
            working_dir: "~/job".into(),
            log_path: "~/job/rjob_runs/execution.log".into(),
            pid_file: pid_file.map(str::to_string),
            env: Vec::new(),
        }
    }

    async fn session(host: &MockHost) -> Box<dyn RemoteSession> {
        host.connect(&MockHost::settings()).await.expect("connect")
    }

    #[test]
    fn directives_are_read_from_comments() {
        let parsed = parse_directives(
            "# rjob-mock: exit=3\n# rjob-mock: stdout=hello world\n# rjob-mock: ignore_term\nprint(1)\n",
        );
        assert_eq!(parsed.exit, 3);
        assert_eq!(parsed.stdout, vec!["hello world".to_string()]);
        assert!(parsed.ignore_term);
        assert!(!parsed.survive_kill);
        assert_eq!(parsed.sleep, Duration::ZERO);
    }

    #[tokio::test]
    async fn script_runs_and_writes_outputs() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path());
        fs::create_dir_all(dir.path().join("job")).expect("mkdir");
        fs::write(
            dir.path().join("job/run.py"),
            "# rjob-mock: stdout=done\n# rjob-mock: write=rjob_runs/out.txt\n",
        )
        .expect("write");

        let session = session(&host).await;
        let out = session
            .execute_script(&launch("run.py", Some("~/job/rjob_runs/.rjob.pid")))
            .await
            .expect("execute");
        assert!(out.success());
        assert_eq!(out.stdout, "done");
        assert!(dir.path().join("job/rjob_runs/out.txt").exists());
        let log = fs::read_to_string(dir.path().join("job/rjob_runs/execution.log")).expect("log");
        assert_eq!(log, "done\n");
    }

    #[tokio::test]
    async fn missing_script_exits_127() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path());
        let out = session(&host)
            .await
            .execute_script(&launch("absent.py", None))
            .await
            .expect("execute");
        assert_eq!(out.exit_code, 127);
    }

    #[tokio::test]
    async fn stubborn_script_needs_sigkill() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path());
        fs::create_dir_all(dir.path().join("job")).expect("mkdir");
        fs::write(
            dir.path().join("job/run.py"),
            "# rjob-mock: sleep_ms=60000\n# rjob-mock: ignore_term\n",
        )
        .expect("write");

        let runner = session(&host).await;
        let running = tokio::spawn(async move {
            runner
                .execute_script(&launch("run.py", Some("~/job/.rjob.pid")))
                .await
        });
        while host.running_processes() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let control = session(&host).await;
        let outcome = control
            .terminate_by_pid_file("~/job/.rjob.pid", Duration::from_millis(100))
            .await
            .expect("terminate");
        assert_eq!(outcome, TerminationOutcome::TerminatedForcefully);
        assert_eq!(host.signals_sent(), vec![Signal::Term, Signal::Kill]);

        let out = running.await.expect("join").expect("execute");
        assert_eq!(out.exit_code, 137);
        assert_eq!(host.connections_opened(), 2);
    }

    #[tokio::test]
    async fn unkillable_script_outlives_termination() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path());
        fs::create_dir_all(dir.path().join("job")).expect("mkdir");
        fs::write(
            dir.path().join("job/run.py"),
            "# rjob-mock: sleep_ms=300\n# rjob-mock: ignore_term\n# rjob-mock: survive_kill\n",
        )
        .expect("write");

        let runner = session(&host).await;
        let running = tokio::spawn(async move {
            runner
                .execute_script(&launch("run.py", Some("~/job/.rjob.pid")))
                .await
        });
        while host.running_processes() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = session(&host)
            .await
            .terminate_by_pid_file("~/job/.rjob.pid", Duration::ZERO)
            .await
            .expect("terminate");
        assert_eq!(outcome, TerminationOutcome::TerminationUnconfirmed);
        assert_eq!(host.running_processes(), 1);

        let out = running.await.expect("join").expect("execute");
        assert_eq!(out.exit_code, 0);
        assert_eq!(host.running_processes(), 0);
    }

    #[tokio::test]
    async fn missing_pid_file_is_reported() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path());
        let err = session(&host)
            .await
            .terminate_by_pid_file("~/nowhere/.rjob.pid", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PidFileNotFound(_)));
    }

    #[tokio::test]
    async fn download_refuses_non_empty_target() {
        let dir = tempdir().expect("tempdir");
        let host = MockHost::new(dir.path().join("home"));
        let session = session(&host).await;
        fs::create_dir_all(dir.path().join("home/job/rjob_runs/plots")).expect("mkdir");
        fs::write(dir.path().join("home/job/rjob_runs/plots/a.png"), "png").expect("write");

        let local = dir.path().join("local");
        let copied = session
            .download_directory("~/job/rjob_runs", &local, false)
            .await
            .expect("download");
        assert_eq!(copied, 1);
        assert!(local.join("plots/a.png").exists());
        assert!(session
            .download_directory("~/job/rjob_runs", &local, false)
            .await
            .is_err());
    }
}
