use crate::plan::RunOp;
use async_trait::async_trait;
use dockhand_models::{BuildPhase, DockhandError, StageKind};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, instrument};

/// Exported to every `RUN` command: the host directory backing the stage's
/// layer.
pub const LAYER_ROOT_VAR: &str = "DOCKHAND_LAYER_ROOT";

/// Executes `RUN` commands against a stage's layer directory.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, op: &RunOp, layer_root: &Path) -> Result<(), DockhandError>;
}

/// Runs commands with the host shell. The working directory is the step's
/// image path mapped into the layer root, and the environment is exactly the
/// step's captured variables plus `PATH` and [`LAYER_ROOT_VAR`].
pub struct HostShellRunner {
    shell: Vec<String>,
}

impl HostShellRunner {
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }
}

pub fn phase_for(stage: StageKind) -> BuildPhase {
    match stage {
        StageKind::Base => BuildPhase::Base,
        StageKind::Dependencies => BuildPhase::Dependencies,
        StageKind::Assembly => BuildPhase::Assembly,
    }
}

#[async_trait]
impl CommandRunner for HostShellRunner {
    #[instrument(skip(self, op, layer_root), fields(stage = %op.stage, line = op.line))]
    async fn run(&self, op: &RunOp, layer_root: &Path) -> Result<(), DockhandError> {
        let (program, shell_args) =
            self.shell
                .split_first()
                .ok_or_else(|| DockhandError::ConfigError {
                    reason: "build.shell must name a program".to_string(),
                })?;

        let cwd = op.cwd.to_host(layer_root);
        tokio::fs::create_dir_all(&cwd).await?;

        let mut command = Command::new(program);
        command
            .args(shell_args)
            .arg(&op.command)
            .current_dir(&cwd)
            .env_clear()
            .envs(&op.env)
            .env(LAYER_ROOT_VAR, layer_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !op.env.contains_key("PATH") {
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
        }

        info!(command = %op.command, cwd = %op.cwd, "Running build command");
        let output = command
            .output()
            .await
            .map_err(|e| DockhandError::CommandFailed {
                phase: phase_for(op.stage),
                command: op.command.clone(),
                status: -1,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                command = %op.command,
                status = ?output.status.code(),
                stderr = %stderr,
                "Build command failed"
            );
            return Err(DockhandError::CommandFailed {
                phase: phase_for(op.stage),
                command: op.command.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dockhand_models::ImagePath;
    use std::collections::BTreeMap;

    fn op(stage: StageKind, command: &str) -> RunOp {
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        RunOp {
            line: 5,
            stage,
            command: command.to_string(),
            cwd: ImagePath::parse("/app").unwrap(),
            env,
        }
    }

    fn runner() -> HostShellRunner {
        HostShellRunner::new(vec!["/bin/sh".into(), "-c".into()])
    }

    #[tokio::test]
    async fn test_run_sees_cwd_and_env() {
        let layer = tempfile::tempdir().unwrap();
        runner()
            .run(
                &op(StageKind::Dependencies, "echo \"$GREETING\" > greeting.txt"),
                layer.path(),
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(layer.path().join("app/greeting.txt")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn test_failure_carries_phase_and_status() {
        let layer = tempfile::tempdir().unwrap();
        let err = runner()
            .run(&op(StageKind::Assembly, "echo boom >&2; exit 3"), layer.path())
            .await
            .unwrap_err();
        match err {
            DockhandError::CommandFailed {
                phase,
                status,
                stderr,
                ..
            } => {
                assert_eq!(phase, BuildPhase::Assembly);
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
