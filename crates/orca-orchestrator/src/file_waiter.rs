//! Startup synchronization on sentinel files.
//!
//! Each job creates a well-known file once it reaches its "started"
//! milestone. [`FileWaiter`] polls for those files through a [`FileProbe`],
//! either on the local filesystem or on a remote node via the remote shell.

use crate::exec;
use async_trait::async_trait;
use orca_core::{OrcaConfig, OrcaError, OrcaResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answers whether a sentinel file exists yet.
#[async_trait]
pub trait FileProbe: Send + Sync {
    async fn exists(&self, path: &Path) -> OrcaResult<bool>;
}

/// Probe for files on the local filesystem (or a shared mount).
#[derive(Debug, Default, Clone)]
pub struct LocalProbe;

#[async_trait]
impl FileProbe for LocalProbe {
    async fn exists(&self, path: &Path) -> OrcaResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| OrcaError::Sync(format!("cannot stat {}: {e}", path.display())))
    }
}

/// Probe that runs `test -e <path>` on a remote node.
#[derive(Debug, Clone)]
pub struct RemoteShellProbe {
    shell: String,
    host: String,
}

impl RemoteShellProbe {
    pub fn new(shell: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            host: host.into(),
        }
    }

    pub fn from_config(config: &OrcaConfig, host: impl Into<String>) -> Self {
        Self::new(config.remote_shell.clone(), host)
    }
}

#[async_trait]
impl FileProbe for RemoteShellProbe {
    async fn exists(&self, path: &Path) -> OrcaResult<bool> {
        let check = format!("test -e {}", exec::shell_quote(&path.to_string_lossy()));
        let args = vec![self.host.clone(), check];
        let status = exec::run_to_completion(&self.shell, &args, None)
            .await
            .map_err(|e| OrcaError::Sync(format!("{} {}: {e}", self.shell, self.host)))?;
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(OrcaError::Sync(format!(
                "existence check on {} failed with {status}",
                self.host
            ))),
        }
    }
}

/// Polls for a fixed set of sentinel files.
pub struct FileWaiter {
    files: Vec<PathBuf>,
    probe: Arc<dyn FileProbe>,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl FileWaiter {
    pub fn new(files: Vec<PathBuf>, probe: Arc<dyn FileProbe>) -> Self {
        Self {
            files,
            probe,
            poll_interval: Duration::from_secs(1),
            timeout: None,
            cancel: None,
        }
    }

    /// Waiter using the configured poll interval and wait timeout.
    pub fn from_config(
        config: &OrcaConfig,
        files: Vec<PathBuf>,
        probe: Arc<dyn FileProbe>,
    ) -> Self {
        Self::new(files, probe)
            .with_poll_interval(config.poll_interval())
            .with_timeout(config.wait_timeout())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound each wait. `None` polls forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Block until any expected file exists and return it.
    ///
    /// Returns `None` only when there are no expected files.
    pub async fn wait_for_first_file(&self) -> OrcaResult<Option<PathBuf>> {
        if self.files.is_empty() {
            return Ok(None);
        }
        info!(count = self.files.len(), "waiting for first sentinel file");
        let start = Instant::now();
        loop {
            for path in &self.files {
                if self.probe.exists(path).await? {
                    info!(path = %path.display(), "first sentinel file found");
                    return Ok(Some(path.clone()));
                }
            }
            self.pause(start, &self.files).await?;
        }
    }

    /// Block until every expected file exists.
    pub async fn wait_for_all_files(&self) -> OrcaResult<()> {
        info!(count = self.files.len(), "waiting for all sentinel files");
        let start = Instant::now();
        let mut missing: Vec<PathBuf> = self.files.clone();
        loop {
            let mut still_missing = Vec::with_capacity(missing.len());
            for path in missing {
                if self.probe.exists(&path).await? {
                    debug!(path = %path.display(), "sentinel file found");
                } else {
                    still_missing.push(path);
                }
            }
            missing = still_missing;
            if missing.is_empty() {
                info!("all sentinel files found");
                return Ok(());
            }
            self.pause(start, &missing).await?;
        }
    }

    async fn pause(&self, start: Instant, missing: &[PathBuf]) -> OrcaResult<()> {
        let mut nap = self.poll_interval;
        if let Some(limit) = self.timeout {
            let waited = start.elapsed();
            if waited >= limit {
                return Err(OrcaError::SyncTimeout {
                    waited,
                    missing: missing.to_vec(),
                });
            }
            nap = nap.min(limit - waited);
        }
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(OrcaError::Sync("wait cancelled".to_string())),
                _ = tokio::time::sleep(nap) => Ok(()),
            },
            None => {
                tokio::time::sleep(nap).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(files: Vec<PathBuf>) -> FileWaiter {
        FileWaiter::new(files, Arc::new(LocalProbe)).with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_first_file_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&b, "").unwrap();

        let found = fast(vec![a, b.clone()]).wait_for_first_file().await.unwrap();
        assert_eq!(found, Some(b));
    }

    #[tokio::test]
    async fn test_first_file_appears_later() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        let waiter = fast(vec![a.clone(), b]);

        let writer = {
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(&a, "").await.unwrap();
            })
        };

        let found = waiter.wait_for_first_file().await.unwrap();
        assert_eq!(found, Some(a));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_all_files_waits_for_last() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("p{i}.log"))).collect();
        std::fs::write(&files[0], "").unwrap();

        let pending = files.clone();
        let writer = tokio::spawn(async move {
            for path in &pending[1..] {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::write(path, "").await.unwrap();
            }
        });

        fast(files.clone()).wait_for_all_files().await.unwrap();
        assert!(files.iter().all(|f| f.exists()));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_set_returns_immediately() {
        let waiter = fast(Vec::new());
        assert_eq!(waiter.wait_for_first_file().await.unwrap(), None);
        waiter.wait_for_all_files().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_lists_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.log");
        let absent = dir.path().join("never.log");
        std::fs::write(&present, "").unwrap();

        let waiter = fast(vec![present, absent.clone()])
            .with_timeout(Some(Duration::from_millis(60)));
        match waiter.wait_for_all_files().await.unwrap_err() {
            OrcaError::SyncTimeout { missing, .. } => assert_eq!(missing, vec![absent]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_configured_sub_second_timeout_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let limit = Duration::from_millis(250);
        let config = OrcaConfig::new("localhost", "shutdown")
            .with_poll_interval(Duration::from_millis(20))
            .with_wait_timeout(Some(limit));
        let waiter = FileWaiter::from_config(
            &config,
            vec![dir.path().join("never.log")],
            Arc::new(LocalProbe),
        );

        let start = Instant::now();
        match waiter.wait_for_first_file().await.unwrap_err() {
            OrcaError::SyncTimeout { waited, .. } => assert!(waited >= limit, "{waited:?}"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(start.elapsed() >= limit);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let waiter = fast(vec![dir.path().join("never.log")]).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let err = waiter.wait_for_first_file().await.unwrap_err();
        assert!(matches!(err, OrcaError::Sync(_)));
        canceller.await.unwrap();
    }

    struct BrokenProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileProbe for BrokenProbe {
        async fn exists(&self, _path: &Path) -> OrcaResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(OrcaError::Sync("host unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_probe_error_propagates_without_retry() {
        let probe = Arc::new(BrokenProbe {
            calls: AtomicUsize::new(0),
        });
        let waiter = FileWaiter::new(vec!["/x".into(), "/y".into()], probe.clone());
        let err = waiter.wait_for_all_files().await.unwrap_err();
        assert!(err.to_string().contains("host unreachable"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_probe_exit_codes() {
        // `sh -c` stands in for the remote shell so the check runs locally.
        let present = RemoteShellProbe::new("sh", "-c");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("launch.log");
        std::fs::write(&file, "").unwrap();

        assert!(present.exists(&file).await.unwrap());
        assert!(!present.exists(&dir.path().join("missing")).await.unwrap());

        let mut config = OrcaConfig::new("localhost", "shutdown");
        config.remote_shell = "/no/such/ssh".to_string();
        let unreachable = RemoteShellProbe::from_config(&config, "node01");
        assert!(matches!(
            unreachable.exists(&file).await,
            Err(OrcaError::Sync(_))
        ));
    }
}
