use rjob_remote::config::ConfigError;
use thiserror::Error;

/// Failures that end a job as `failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connection settings are incomplete")]
    ConfigurationMissing(#[from] ConfigError),
    #[error("could not connect to {host}")]
    Connect {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{what} failed")]
    Transfer {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("script exited with code {exit_code}\nstdout: {stdout}\nstderr: {stderr}")]
    RemoteExecution {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("connection to {host} lost while the script was running")]
    ConnectionLost {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("job worker panicked: {0}")]
    WorkerPanicked(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::RemoteExecution { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}
