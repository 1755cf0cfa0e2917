use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = String;

/// Allocates a fresh job identifier: the first 12 hex characters of a v4 UUID.
pub fn new_job_id() -> JobId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    Uploading,
    Executing,
    Downloading,
    Finalizing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Uploading => "uploading",
            Stage::Executing => "executing",
            Stage::Downloading => "downloading",
            Stage::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OrchestratorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorStatus::Succeeded | OrchestratorStatus::Failed | OrchestratorStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<ResultStatus> for OrchestratorStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Succeeded => OrchestratorStatus::Succeeded,
            ResultStatus::Failed => OrchestratorStatus::Failed,
            ResultStatus::Cancelled => OrchestratorStatus::Cancelled,
        }
    }
}

/// Mutable progress of the job currently owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub script_path: PathBuf,
    pub work_dir: PathBuf,
    pub stage: Stage,
    pub progress_pct: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: JobId, script_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            job_id,
            script_path,
            work_dir,
            stage: Stage::Initializing,
            progress_pct: 0,
            started_at: Utc::now(),
            ended_at: None,
            cancel_requested: false,
            cancel_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Applies a checkpoint without ever moving stage or progress backwards.
    pub fn advance(&mut self, stage: Option<Stage>, progress_pct: Option<u8>) {
        if let Some(stage) = stage {
            self.stage = self.stage.max(stage);
        }
        if let Some(pct) = progress_pct {
            self.progress_pct = self.progress_pct.max(pct.min(100));
        }
    }
}

/// Outcome of the most recently finalized job. Replaced wholesale on every completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: ResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_artifacts_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    InvalidInput,
    NotRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub message: String,
}

impl SubmitResponse {
    pub fn accepted(job_id: JobId) -> Self {
        Self {
            accepted: true,
            job_id: Some(job_id),
            reason: None,
            message: "job accepted".into(),
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            job_id: None,
            reason: Some(reason),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: OrchestratorStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl ResultSnapshot {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            message: Some("no job has finished yet".into()),
            result: None,
        }
    }

    pub fn of(result: JobResult) -> Self {
        Self {
            available: true,
            message: None,
            result: Some(result),
        }
    }
}

/// What the process lifecycle controller observed while terminating a remote process group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    AlreadyExited,
    TerminatedGracefully,
    TerminatedForcefully,
    TerminationUnconfirmed,
}

impl TerminationOutcome {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, TerminationOutcome::TerminationUnconfirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminateResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TerminationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl TerminateResponse {
    pub fn not_running() -> Self {
        Self {
            accepted: false,
            reason: Some(RejectReason::NotRunning),
            message: "no job is running".into(),
            outcome: None,
            warning: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    UserPassword {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        key_path: PathBuf,
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::UserPassword { username, .. } | Credential::SshKey { username, .. } => {
                username
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &"******")
                .finish(),
            Credential::SshKey {
                username,
                key_path,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("key_path", key_path)
                .field("passphrase", &"******")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyCheck {
    #[default]
    DefaultKnownHosts,
    KnownHostsFile(PathBuf),
    NoCheck,
}

impl FromStr for HostKeyCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("empty host key check mode".into()),
            "default" => Ok(HostKeyCheck::DefaultKnownHosts),
            "none" | "no" | "off" => Ok(HostKeyCheck::NoCheck),
            path => Ok(HostKeyCheck::KnownHostsFile(PathBuf::from(path))),
        }
    }
}

/// Everything needed to open a session to the managed remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub credential: Credential,
    #[serde(default)]
    pub host_key_check: HostKeyCheck,
    pub interpreter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_short_hex_and_distinct() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn advance_never_regresses() {
        let mut record = JobRecord::new("abc".into(), "s.py".into(), ".".into());
        record.advance(Some(Stage::Executing), Some(50));
        record.advance(Some(Stage::Uploading), Some(20));
        assert_eq!(record.stage, Stage::Executing);
        assert_eq!(record.progress_pct, 50);
        record.advance(None, Some(250));
        assert_eq!(record.progress_pct, 100);
    }

    #[test]
    fn host_key_check_parses_modes() {
        assert_eq!("default".parse::<HostKeyCheck>(), Ok(HostKeyCheck::DefaultKnownHosts));
        assert_eq!("none".parse::<HostKeyCheck>(), Ok(HostKeyCheck::NoCheck));
        assert_eq!(
            "/etc/ssh/known".parse::<HostKeyCheck>(),
            Ok(HostKeyCheck::KnownHostsFile("/etc/ssh/known".into()))
        );
    }
}
