pub mod config;
pub mod lifecycle;
pub mod mock;
pub mod shell;
pub mod ssh;
pub mod transfer;

pub use lifecycle::{LifecycleError, ProcessControl, ProcessController, Signal};

use anyhow::Result;
use async_trait::async_trait;
use rjob_model::{ConnectionSettings, TerminationOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one shell command on the remote host and captures its output.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
}

/// A script run inside a remote working directory.
///
/// When `pid_file` is set the script is started in its own session and the
/// session leader's PID is written there before the script produces output.
#[derive(Debug, Clone)]
pub struct ScriptLaunch {
    pub script_path: String,
    pub working_dir: String,
    pub log_path: String,
    pub pid_file: Option<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    /// Resolves a leading `~/` against the remote home directory.
    fn expand_path(&self, path: &str) -> String;

    async fn upload_directory(&self, local: &Path, remote: &str, exclude: &[String]) -> Result<usize>;

    async fn download_directory(&self, remote: &str, local: &Path, overwrite: bool) -> Result<usize>;

    async fn execute_script(&self, launch: &ScriptLaunch) -> Result<ExecOutput>;

    async fn terminate_by_pid_file(
        &self,
        pid_file: &str,
        grace: Duration,
    ) -> Result<TerminationOutcome, LifecycleError>;

    async fn remove_path(&self, remote: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn RemoteSession>>;
}

pub type DynRemoteConnector = Arc<dyn RemoteConnector>;
