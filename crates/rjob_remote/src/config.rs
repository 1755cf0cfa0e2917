use once_cell::sync::Lazy;
use rjob_model::{ConnectionSettings, Credential, HostKeyCheck};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SSH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_TRANSFER_CHUNK_BYTES: usize = 48 * 1024;
const DEFAULT_SSH_KEEPALIVE_SECS: u64 = 15;
/// Unanswered keepalives tolerated before the connection is declared dead.
pub const SSH_KEEPALIVE_MAX: usize = 3;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_INTERPRETER: &str = "python3 -u";

static SSH_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    env_duration(
        "RJOB_SSH_TIMEOUT_SECS",
        Duration::from_secs(DEFAULT_SSH_TIMEOUT_SECS),
        Duration::from_secs,
    )
});

static POLL_INTERVAL: Lazy<Duration> = Lazy::new(|| {
    env_duration(
        "RJOB_POLL_INTERVAL_MS",
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        Duration::from_millis,
    )
});

static SSH_KEEPALIVE: Lazy<Duration> = Lazy::new(|| {
    env_duration(
        "RJOB_SSH_KEEPALIVE_SECS",
        Duration::from_secs(DEFAULT_SSH_KEEPALIVE_SECS),
        Duration::from_secs,
    )
});

static TRANSFER_CHUNK: Lazy<usize> = Lazy::new(|| {
    std::env::var("RJOB_TRANSFER_CHUNK_BYTES")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TRANSFER_CHUNK_BYTES)
});

/// Upper bound for short control commands (mkdir, ps, kill). Script runs are unbounded.
pub fn ssh_command_timeout() -> Duration {
    *SSH_TIMEOUT
}

/// Interval between liveness checks while a process group is being terminated.
pub fn poll_interval() -> Duration {
    *POLL_INTERVAL
}

/// Keepalive period on SSH connections. A silent peer is dropped after
/// [`SSH_KEEPALIVE_MAX`] missed replies, which also ends an unbounded script run.
pub fn ssh_keepalive_interval() -> Duration {
    *SSH_KEEPALIVE
}

pub fn transfer_chunk_bytes() -> usize {
    *TRANSFER_CHUNK
}

fn env_duration(var: &str, default: Duration, unit: fn(u64) -> Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|value: &u64| *value > 0)
        .map(unit)
        .unwrap_or(default)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {var}: {detail}")]
    Invalid { var: &'static str, detail: String },
}

/// Source of connection parameters, consulted once per job.
pub trait SettingsProvider: Send + Sync {
    fn load(&self) -> Result<ConnectionSettings, ConfigError>;
}

/// Fixed settings, mostly for tests and embedding.
pub struct StaticSettings(pub ConnectionSettings);

impl SettingsProvider for StaticSettings {
    fn load(&self) -> Result<ConnectionSettings, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Reads `RJOB_*` variables from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSettings;

impl SettingsProvider for EnvSettings {
    fn load(&self) -> Result<ConnectionSettings, ConfigError> {
        settings_from(|name| std::env::var(name).ok())
    }
}

pub fn settings_from<F>(lookup: F) -> Result<ConnectionSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    let host = get("RJOB_HOST");
    let user = get("RJOB_USER");
    let identity = get("RJOB_IDENTITY_FILE");
    let password = get("RJOB_PASSWORD");

    let mut missing = Vec::new();
    if host.is_none() {
        missing.push("RJOB_HOST");
    }
    if user.is_none() {
        missing.push("RJOB_USER");
    }
    if identity.is_none() && password.is_none() {
        missing.push("RJOB_IDENTITY_FILE");
    }
    let (Some(host), Some(username)) = (host, user) else {
        return Err(ConfigError::Missing(missing));
    };
    if !missing.is_empty() {
        return Err(ConfigError::Missing(missing));
    }

    let credential = match identity {
        Some(key_path) => Credential::SshKey {
            username,
            key_path: PathBuf::from(key_path),
            passphrase: get("RJOB_KEY_PASSPHRASE"),
        },
        None => Credential::UserPassword {
            username,
            password: password.unwrap_or_default(),
        },
    };

    let port = match get("RJOB_PORT") {
        Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
            var: "RJOB_PORT",
            detail: format!("'{raw}' is not a port number"),
        })?,
        None => DEFAULT_SSH_PORT,
    };

    let host_key_check = match get("RJOB_KNOWN_HOSTS") {
        Some(raw) => raw.parse::<HostKeyCheck>().map_err(|detail| ConfigError::Invalid {
            var: "RJOB_KNOWN_HOSTS",
            detail,
        })?,
        None => HostKeyCheck::default(),
    };

    let interpreter = match (get("RJOB_INTERPRETER"), get("RJOB_PYTHON_VERSION")) {
        (Some(interpreter), _) => interpreter,
        (None, Some(version)) => format!("~/.py{}/bin/python3 -u", version.trim()),
        (None, None) => DEFAULT_INTERPRETER.to_string(),
    };

    Ok(ConnectionSettings {
        host,
        port,
        credential,
        host_key_check,
        interpreter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn reports_every_missing_variable() {
        let err = settings_from(lookup(&[("RJOB_PORT", "2222")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["RJOB_HOST", "RJOB_USER", "RJOB_IDENTITY_FILE"])
        );
        assert!(err.to_string().contains("RJOB_HOST, RJOB_USER"));
    }

    #[test]
    fn key_credential_wins_over_password() {
        let settings = settings_from(lookup(&[
            ("RJOB_HOST", "127.0.0.1"),
            ("RJOB_USER", "jovyan"),
            ("RJOB_IDENTITY_FILE", "/keys/id_ed25519"),
            ("RJOB_PASSWORD", "unused"),
            ("RJOB_PORT", "2222"),
            ("RJOB_PYTHON_VERSION", "311"),
        ]))
        .expect("settings");
        assert_eq!(settings.port, 2222);
        assert_eq!(settings.interpreter, "~/.py311/bin/python3 -u");
        assert!(matches!(settings.credential, Credential::SshKey { .. }));
    }

    #[test]
    fn zero_durations_fall_back_to_default() {
        std::env::set_var("RJOB_TEST_ZERO_INTERVAL_MS", "0");
        std::env::set_var("RJOB_TEST_SHORT_INTERVAL_MS", "25");
        let fallback = Duration::from_millis(500);
        assert_eq!(
            env_duration("RJOB_TEST_ZERO_INTERVAL_MS", fallback, Duration::from_millis),
            fallback
        );
        assert_eq!(
            env_duration("RJOB_TEST_SHORT_INTERVAL_MS", fallback, Duration::from_millis),
            Duration::from_millis(25)
        );
        assert_eq!(
            env_duration("RJOB_TEST_UNSET_INTERVAL_MS", fallback, Duration::from_millis),
            fallback
        );
    }

    #[test]
    fn rejects_bad_port() {
        let err = settings_from(lookup(&[
            ("RJOB_HOST", "h"),
            ("RJOB_USER", "u"),
            ("RJOB_PASSWORD", "p"),
            ("RJOB_PORT", "ssh"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "RJOB_PORT", .. }));
    }
}
