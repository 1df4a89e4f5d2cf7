use crate::exec;
use async_trait::async_trait;
use orca_core::{JobDescriptor, OrcaConfig, OrcaError, OrcaResult};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

/// Record of a job that was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedJob {
    /// Position of the job in the launch order.
    pub index: usize,
    /// OS process id of the local child, when there is one.
    pub pid: Option<u32>,
    /// Node the job was sent to, if remote.
    pub target_node: Option<String>,
}

/// Starts one job without waiting for it to finish.
#[async_trait]
pub trait JobSpawner: Send + Sync {
    async fn spawn(&self, index: usize, job: &JobDescriptor) -> OrcaResult<SpawnedJob>;
}

fn launch_error(index: usize, job: &JobDescriptor, reason: impl Into<String>) -> OrcaError {
    OrcaError::Launch {
        index,
        program: job.program().to_string(),
        target: job.target_node.clone(),
        reason: reason.into(),
    }
}

/// Fire-and-forget process spawner.
///
/// Local jobs are exec'd directly in their working directory; remote jobs go
/// through the configured remote shell. Children are detached: they are never
/// awaited and keep running if the launcher goes away.
pub struct ProcessSpawner {
    config: Arc<OrcaConfig>,
}

impl ProcessSpawner {
    pub fn new(config: Arc<OrcaConfig>) -> Self {
        Self { config }
    }

    fn command_for(&self, job: &JobDescriptor) -> Command {
        let mut cmd = match &job.target_node {
            Some(host) => {
                let (program, args) = exec::remote_command(
                    &self.config.remote_shell,
                    host,
                    &job.working_dir,
                    &job.command,
                );
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new(job.program());
                cmd.args(job.args()).current_dir(&job.working_dir);
                cmd
            }
        };
        cmd.stdin(Stdio::null()).kill_on_drop(false);
        cmd
    }
}

#[async_trait]
impl JobSpawner for ProcessSpawner {
    async fn spawn(&self, index: usize, job: &JobDescriptor) -> OrcaResult<SpawnedJob> {
        if self.config.dry_run {
            info!(
                job = index,
                command = ?job.command,
                node = ?job.target_node,
                "dry run: not spawning job"
            );
            return Ok(SpawnedJob {
                index,
                pid: None,
                target_node: job.target_node.clone(),
            });
        }

        let child = self
            .command_for(job)
            .spawn()
            .map_err(|e| launch_error(index, job, e.to_string()))?;
        let pid = child.id();
        info!(
            job = index,
            pid = ?pid,
            program = job.program(),
            node = ?job.target_node,
            "job spawned"
        );

        Ok(SpawnedJob {
            index,
            pid,
            target_node: job.target_node.clone(),
        })
    }
}

/// Batch-queue style submission: the descriptor's command is a submit tool
/// that exits once the job is queued, and a non-zero exit means rejection.
pub struct SubmitSpawner {
    config: Arc<OrcaConfig>,
}

impl SubmitSpawner {
    pub fn new(config: Arc<OrcaConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl JobSpawner for SubmitSpawner {
    async fn spawn(&self, index: usize, job: &JobDescriptor) -> OrcaResult<SpawnedJob> {
        if self.config.dry_run {
            info!(job = index, command = ?job.command, "dry run: not submitting job");
            return Ok(SpawnedJob {
                index,
                pid: None,
                target_node: job.target_node.clone(),
            });
        }

        let status = match &job.target_node {
            Some(host) => {
                let (program, args) = exec::remote_command(
                    &self.config.remote_shell,
                    host,
                    &job.working_dir,
                    &job.command,
                );
                exec::run_to_completion(&program, &args, None).await
            }
            None => {
                let cwd = job.working_dir.as_path();
                exec::run_to_completion(job.program(), job.args(), Some(cwd)).await
            }
        }
        .map_err(|e| launch_error(index, job, e.to_string()))?;

        if !status.success() {
            warn!(job = index, code = ?status.code(), "submission rejected");
            return Err(launch_error(
                index,
                job,
                format!("submit command exited with {status}"),
            ));
        }

        info!(job = index, program = job.program(), "job submitted");
        Ok(SpawnedJob {
            index,
            pid: None,
            target_node: job.target_node.clone(),
        })
    }
}
