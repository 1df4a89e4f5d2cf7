use crate::feed::EventFeed;
use crate::file_waiter::FileWaiter;
use crate::monitor::{validate_pipelines, StatusListener, WorkflowMonitor};
use crate::spawner::{JobSpawner, SpawnedJob};
use orca_core::{JobDescriptor, OrcaConfig, OrcaError, OrcaResult, PipelineName, RunId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Starts every job of one workflow, waits for their sentinel files and
/// hands over to a [`WorkflowMonitor`].
pub struct WorkflowLauncher {
    config: Arc<OrcaConfig>,
    run_id: RunId,
    jobs: Vec<JobDescriptor>,
    pipelines: Vec<PipelineName>,
    waiter: FileWaiter,
    spawner: Arc<dyn JobSpawner>,
    feed: Arc<dyn EventFeed>,
    staging_dir: Option<PathBuf>,
    spawned: Vec<SpawnedJob>,
    launched: bool,
    cleaned: bool,
}

impl WorkflowLauncher {
    pub fn new(
        config: Arc<OrcaConfig>,
        run_id: RunId,
        jobs: Vec<JobDescriptor>,
        pipelines: Vec<PipelineName>,
        waiter: FileWaiter,
        spawner: Arc<dyn JobSpawner>,
        feed: Arc<dyn EventFeed>,
    ) -> Self {
        let staging_dir = config.staging_dir.clone();
        Self {
            config,
            run_id,
            jobs,
            pipelines,
            waiter,
            spawner,
            feed,
            staging_dir,
            spawned: Vec::new(),
            launched: false,
            cleaned: false,
        }
    }

    /// Directory removed by [`clean_up`](Self::clean_up).
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    /// Jobs started so far by [`launch`](Self::launch).
    pub fn spawned_jobs(&self) -> &[SpawnedJob] {
        &self.spawned
    }

    fn validate(&self) -> OrcaResult<()> {
        if self.launched {
            return Err(OrcaError::Config(format!(
                "workflow {} already launched",
                self.run_id
            )));
        }
        if self.jobs.is_empty() {
            return Err(OrcaError::Config(format!(
                "workflow {} has no jobs",
                self.run_id
            )));
        }
        for (index, job) in self.jobs.iter().enumerate() {
            job.validate()
                .map_err(|e| OrcaError::Config(format!("job #{index}: {e}")))?;
        }
        validate_pipelines(&self.pipelines)
    }

    /// Launch the workflow.
    ///
    /// 1. Validates the job list and pipeline names; nothing is spawned on error.
    /// 2. Spawns every job in order without waiting on any of them. A spawn
    ///    failure aborts here, before any sentinel file is polled.
    /// 3. Waits for the first sentinel file, then for all of them.
    /// 4. Builds the monitor, registers `status_listener` and starts it.
    ///
    /// Jobs already running when a wait fails are left alone. Once the
    /// monitor exists, problems are reported through it rather than returned.
    pub async fn launch(
        &mut self,
        status_listener: Option<Arc<dyn StatusListener>>,
    ) -> OrcaResult<WorkflowMonitor> {
        self.validate()?;
        self.launched = true;
        let start = Instant::now();
        info!(run_id = %self.run_id, jobs = self.jobs.len(), "launching workflow");

        for (index, job) in self.jobs.iter().enumerate() {
            let spawned = self.spawner.spawn(index, job).await.map_err(|e| {
                error!(run_id = %self.run_id, job = index, error = %e, "job spawn failed");
                match e {
                    OrcaError::Launch { .. } => e,
                    other => OrcaError::Launch {
                        index,
                        program: job.program().to_string(),
                        target: job.target_node.clone(),
                        reason: other.to_string(),
                    },
                }
            })?;
            self.spawned.push(spawned);
        }

        if self.config.dry_run {
            info!(run_id = %self.run_id, "dry run: skipping startup synchronization");
        } else {
            if let Some(first) = self.waiter.wait_for_first_file().await? {
                debug!(run_id = %self.run_id, path = %first.display(), "workflow producing output");
            }
            self.waiter.wait_for_all_files().await?;
        }
        info!(
            run_id = %self.run_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "all jobs started"
        );

        let monitor = WorkflowMonitor::new(
            &self.config,
            self.run_id.clone(),
            &self.pipelines,
            Arc::clone(&self.feed),
        )?;
        if let Some(listener) = status_listener {
            monitor.add_status_listener(listener);
        }
        monitor.start_monitor_task().await?;
        Ok(monitor)
    }

    /// Release launcher-held resources. Repeated calls do nothing.
    pub fn clean_up(&mut self) -> OrcaResult<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        debug!(run_id = %self.run_id, "cleaning up launcher");

        if let Some(dir) = self.staging_dir.take() {
            remove_staging_dir(&dir)?;
        }
        Ok(())
    }
}

fn remove_staging_dir(dir: &Path) -> OrcaResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            info!(path = %dir.display(), "staging directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to remove staging directory");
            Err(e.into())
        }
    }
}
