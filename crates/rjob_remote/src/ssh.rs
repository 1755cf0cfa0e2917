use crate::lifecycle::{self, LifecycleError, ProcessController, ShellProcessControl};
use crate::transfer::{self, TransferFilter};
use crate::{config, shell, ExecOutput, RemoteConnector, RemoteSession, RemoteShell, ScriptLaunch};
use anyhow::{bail, Context, Result};
use async_ssh2_tokio::{AuthMethod, Client, Config, ServerCheckMethod};
use async_trait::async_trait;
use rjob_model::{ConnectionSettings, Credential, HostKeyCheck, TerminationOutcome};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

pub fn command_timeout() -> Duration {
    config::ssh_command_timeout()
}

/// Client configuration with keepalives, so a partitioned peer surfaces as an
/// error instead of a channel that never returns.
pub fn client_config(keepalive: Duration) -> Config {
    Config {
        keepalive_interval: Some(keepalive),
        keepalive_max: config::SSH_KEEPALIVE_MAX,
        ..Config::default()
    }
}

/// Opens authenticated SSH sessions with `async-ssh2-tokio`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession::connect(settings).await?;
        Ok(Box::new(session))
    }
}

pub struct SshSession {
    client: Client,
    host: String,
    home: String,
    interpreter: String,
}

enum TargetAddr {
    Socket(SocketAddr),
    HostPort(String, u16),
}

impl SshSession {
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self> {
        let (username, auth) = credential_to_auth(&settings.credential).await?;
        let server_check = match &settings.host_key_check {
            HostKeyCheck::DefaultKnownHosts => ServerCheckMethod::DefaultKnownHostsFile,
            HostKeyCheck::KnownHostsFile(path) => {
                ServerCheckMethod::KnownHostsFile(path.to_string_lossy().into_owned())
            }
            HostKeyCheck::NoCheck => ServerCheckMethod::NoCheck,
        };

        let target = SocketAddr::from_str(&settings.host)
            .map(TargetAddr::Socket)
            .unwrap_or_else(|_| TargetAddr::HostPort(settings.host.clone(), settings.port));

        let client_config = client_config(config::ssh_keepalive_interval());
        let connecting = async {
            match target {
                TargetAddr::Socket(addr) => {
                    Client::connect_with_config(addr, &username, auth, server_check, client_config).await
                }
                TargetAddr::HostPort(host, port) => {
                    Client::connect_with_config(
                        (host.as_str(), port),
                        &username,
                        auth,
                        server_check,
                        client_config,
                    )
                    .await
                }
            }
        };
        let client = tokio::time::timeout(command_timeout(), connecting)
            .await
            .with_context(|| format!("ssh connect timeout {}", settings.host))?
            .with_context(|| format!("ssh connect {}@{}:{}", username, settings.host, settings.port))?;

        let mut session = Self {
            client,
            host: settings.host.clone(),
            home: String::new(),
            interpreter: String::new(),
        };
        let home = session.exec(r#"printf %s "$HOME""#).await?;
        if !home.success() || home.stdout.trim().is_empty() {
            bail!("could not resolve remote home directory on {}", settings.host);
        }
        session.home = home.stdout.trim().to_string();
        session.interpreter = shell::expand_home(&settings.interpreter, &session.home);
        info!(target: "remote::ssh", "connected to {} as {}", settings.host, username);
        Ok(session)
    }

    async fn exec_unbounded(&self, command: &str) -> Result<ExecOutput> {
        let result = self
            .client
            .execute(command)
            .await
            .with_context(|| format!("ssh exec on {}", self.host))?;
        Ok(ExecOutput {
            exit_code: i32::try_from(result.exit_status).unwrap_or(-1),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

async fn credential_to_auth(credential: &Credential) -> Result<(String, AuthMethod)> {
    match credential {
        Credential::UserPassword { username, password } => {
            Ok((username.clone(), AuthMethod::with_password(password)))
        }
        Credential::SshKey {
            username,
            key_path,
            passphrase,
        } => {
            let key_content = fs::read_to_string(key_path)
                .await
                .with_context(|| format!("reading ssh key {}", key_path.display()))?;
            Ok((
                username.clone(),
                AuthMethod::with_key(&key_content, passphrase.as_deref()),
            ))
        }
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        debug!(target: "remote::ssh", "exec on {}: {}", self.host, command);
        tokio::time::timeout(command_timeout(), self.exec_unbounded(command))
            .await
            .with_context(|| format!("ssh exec timeout {} {}", self.host, command))?
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn expand_path(&self, path: &str) -> String {
        shell::expand_home(path, &self.home)
    }

    async fn upload_directory(&self, local: &Path, remote: &str, exclude: &[String]) -> Result<usize> {
        let remote = self.expand_path(remote);
        let filter = TransferFilter::new(exclude.iter().cloned());
        transfer::upload_tree(self, local, &remote, &filter).await
    }

    async fn download_directory(&self, remote: &str, local: &Path, overwrite: bool) -> Result<usize> {
        let remote = self.expand_path(remote);
        transfer::download_tree(self, &remote, local, overwrite, &TransferFilter::default()).await
    }

    async fn execute_script(&self, launch: &ScriptLaunch) -> Result<ExecOutput> {
        let launch = ScriptLaunch {
            script_path: self.expand_path(&launch.script_path),
            working_dir: self.expand_path(&launch.working_dir),
            log_path: self.expand_path(&launch.log_path),
            pid_file: launch.pid_file.as_deref().map(|pid| self.expand_path(pid)),
            env: launch.env.clone(),
        };
        let command = lifecycle::launch_command(&self.interpreter, &launch);
        info!(target: "remote::ssh", "running {} on {}", launch.script_path, self.host);
        self.exec_unbounded(&command).await
    }

    async fn terminate_by_pid_file(
        &self,
        pid_file: &str,
        grace: Duration,
    ) -> Result<TerminationOutcome, LifecycleError> {
        let pid_file = self.expand_path(pid_file);
        ProcessController::new(ShellProcessControl::new(self))
            .terminate(&pid_file, grace)
            .await
    }

    async fn remove_path(&self, remote: &str) -> Result<()> {
        let remote = self.expand_path(remote);
        if remote.trim_end_matches('/').is_empty() || remote == self.home {
            bail!("refusing to remove {remote:?}");
        }
        let out = self.exec(&format!("rm -rf {}", shell::quote(&remote))).await?;
        if !out.success() {
            bail!("rm -rf {} failed: {}", remote, out.stderr.trim());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .with_context(|| format!("ssh disconnect {}", self.host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_detects_dead_peers() {
        let config = client_config(Duration::from_secs(7));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(7)));
        assert_eq!(config.keepalive_max, config::SSH_KEEPALIVE_MAX);
        assert!(config::ssh_keepalive_interval() > Duration::ZERO);
    }
}
