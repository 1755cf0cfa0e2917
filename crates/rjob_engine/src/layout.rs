use rjob_remote::shell;
use std::path::{Path, PathBuf};

pub const DEFAULT_REMOTE_ROOT: &str = "rjob-jobs";
pub const DEFAULT_ARTIFACTS_DIR: &str = "rjob_runs";
pub const LOG_FILE_NAME: &str = "execution.log";
pub const PID_FILE_NAME: &str = ".rjob.pid";

/// Where a job's files live on both ends.
///
/// Remote: `~/<remote_root>/<job_id>/` holding the uploaded tree, the log and the
/// PID file. Local: `<work_dir>/<artifacts_dir>/<job_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub remote_root: String,
    pub artifacts_dir: String,
}

impl Default for JobLayout {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.into(),
            artifacts_dir: DEFAULT_ARTIFACTS_DIR.into(),
        }
    }
}

impl JobLayout {
    /// Defaults overridden by `RJOB_REMOTE_ROOT` and `RJOB_ARTIFACTS_DIR`.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().trim_matches('/').to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            remote_root: var("RJOB_REMOTE_ROOT").unwrap_or(defaults.remote_root),
            artifacts_dir: var("RJOB_ARTIFACTS_DIR").unwrap_or(defaults.artifacts_dir),
        }
    }

    pub fn remote_job_dir(&self, job_id: &str) -> String {
        shell::join(&format!("~/{}", self.remote_root), job_id)
    }

    pub fn remote_log(&self, job_id: &str) -> String {
        shell::join(&self.remote_job_dir(job_id), LOG_FILE_NAME)
    }

    pub fn remote_pid_file(&self, job_id: &str) -> String {
        shell::join(&self.remote_job_dir(job_id), PID_FILE_NAME)
    }

    pub fn local_artifacts(&self, work_dir: &Path, job_id: &str) -> PathBuf {
        work_dir.join(&self.artifacts_dir).join(job_id)
    }

    /// Names skipped when uploading the working directory.
    pub fn upload_excludes(&self) -> Vec<String> {
        vec![self.artifacts_dir.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_scoped_by_job() {
        let layout = JobLayout::default();
        assert_eq!(layout.remote_job_dir("abc"), "~/rjob-jobs/abc");
        assert_eq!(layout.remote_log("abc"), "~/rjob-jobs/abc/execution.log");
        assert_eq!(layout.remote_pid_file("abc"), "~/rjob-jobs/abc/.rjob.pid");
        assert_eq!(
            layout.local_artifacts(Path::new("/work"), "abc"),
            PathBuf::from("/work/rjob_runs/abc")
        );
    }
}
