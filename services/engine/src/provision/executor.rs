//! Configuration-management execution.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Variables handed to a playbook as `--extra-vars` JSON.
pub type ExtraVars = BTreeMap<String, Value>;

/// Executor errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor binary could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The playbook exited unsuccessfully.
    #[error("playbook {playbook} failed with {status}: {stderr}")]
    Failed {
        playbook: String,
        status: String,
        stderr: String,
    },

    #[error("encoding extra vars: {0}")]
    Vars(#[from] serde_json::Error),
}

#[async_trait]
pub trait PlaybookExecutor: Send + Sync {
    async fn run(
        &self,
        playbook: &Path,
        inventory: Option<&Path>,
        vars: &ExtraVars,
    ) -> Result<(), ExecutorError>;
}

/// Runs `ansible-playbook` as a child process.
pub struct AnsibleExecutor {
    program: String,
}

impl AnsibleExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(
        playbook: &Path,
        inventory: Option<&Path>,
        vars: &ExtraVars,
    ) -> Result<Vec<String>, ExecutorError> {
        let mut args = vec![playbook.display().to_string()];
        if let Some(inventory) = inventory {
            args.push(format!("--inventory={}", inventory.display()));
        }
        if !vars.is_empty() {
            args.push("--extra-vars".to_string());
            args.push(serde_json::to_string(vars)?);
        }
        Ok(args)
    }
}

impl Default for AnsibleExecutor {
    fn default() -> Self {
        Self::new("ansible-playbook")
    }
}

#[async_trait]
impl PlaybookExecutor for AnsibleExecutor {
    async fn run(
        &self,
        playbook: &Path,
        inventory: Option<&Path>,
        vars: &ExtraVars,
    ) -> Result<(), ExecutorError> {
        let args = Self::args(playbook, inventory, vars)?;
        info!(playbook = %playbook.display(), "Running playbook");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        debug!(
            playbook = %playbook.display(),
            stdout = %String::from_utf8_lossy(&output.stdout),
            "Playbook output"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(playbook = %playbook.display(), status = %output.status, "Playbook failed");
            return Err(ExecutorError::Failed {
                playbook: playbook.display().to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(())
    }
}

/// One recorded playbook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookRun {
    pub playbook: PathBuf,
    pub inventory: Option<PathBuf>,
    pub vars: ExtraVars,
}

/// Executor that records invocations instead of running them.
#[derive(Default)]
pub struct RecordingExecutor {
    runs: Mutex<Vec<PlaybookRun>>,
    /// Playbooks (by path suffix) that fail.
    failing: BTreeSet<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every playbook whose path ends with one of `suffixes`.
    pub fn failing_for<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            runs: Mutex::default(),
            failing: suffixes.into_iter().map(Into::into).collect(),
        }
    }

    pub async fn runs(&self) -> Vec<PlaybookRun> {
        self.runs.lock().await.clone()
    }

    /// Recorded playbook paths relative to `scripts`.
    pub async fn playbooks(&self, scripts: &Path) -> Vec<String> {
        self.runs
            .lock()
            .await
            .iter()
            .map(|run| {
                run.playbook
                    .strip_prefix(scripts)
                    .unwrap_or(&run.playbook)
                    .display()
                    .to_string()
            })
            .collect()
    }
}

#[async_trait]
impl PlaybookExecutor for RecordingExecutor {
    async fn run(
        &self,
        playbook: &Path,
        inventory: Option<&Path>,
        vars: &ExtraVars,
    ) -> Result<(), ExecutorError> {
        self.runs.lock().await.push(PlaybookRun {
            playbook: playbook.to_path_buf(),
            inventory: inventory.map(Path::to_path_buf),
            vars: vars.clone(),
        });

        let path = playbook.display().to_string();
        if self.failing.iter().any(|suffix| path.ends_with(suffix.as_str())) {
            return Err(ExecutorError::Failed {
                playbook: path,
                status: "exit status: 2".to_string(),
                stderr: "recorded failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ansible_args() {
        let vars = ExtraVars::from([("master_ip".to_string(), Value::from("10.0.0.1"))]);
        let args = AnsibleExecutor::args(
            Path::new("scripts/k3s/join_k3s_nodes.yml"),
            Some(Path::new("/tmp/inv/inventory")),
            &vars,
        )
        .unwrap();

        assert_eq!(
            args,
            vec![
                "scripts/k3s/join_k3s_nodes.yml",
                "--inventory=/tmp/inv/inventory",
                "--extra-vars",
                r#"{"master_ip":"10.0.0.1"}"#,
            ]
        );
    }

    #[test]
    fn test_no_extra_vars_flag_when_empty() {
        let args =
            AnsibleExecutor::args(Path::new("common/add_hostname.yml"), None, &ExtraVars::new())
                .unwrap();
        assert_eq!(args, vec!["common/add_hostname.yml"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let executor = AnsibleExecutor::new("/nonexistent/ansible-playbook");
        let err = executor
            .run(Path::new("x.yml"), None, &ExtraVars::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_recording_executor_fails_on_suffix() {
        let executor = RecordingExecutor::failing_for(["docker/main.yml"]);
        let vars = ExtraVars::new();

        executor
            .run(Path::new("/s/common/add_hostname.yml"), None, &vars)
            .await
            .unwrap();
        assert!(executor
            .run(Path::new("/s/docker/main.yml"), None, &vars)
            .await
            .is_err());
        assert_eq!(
            executor.playbooks(Path::new("/s")).await,
            vec!["common/add_hostname.yml", "docker/main.yml"]
        );
    }
}
