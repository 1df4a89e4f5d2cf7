use crate::env_string;
use crate::error::{OrcaError, OrcaResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run-wide settings shared by the launcher, waiter, spawners and monitor.
///
/// Built once and passed explicitly into every constructor that needs it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrcaConfig {
    /// Log what would happen without spawning or waiting on anything.
    #[serde(default)]
    pub dry_run: bool,
    /// 0 = normal, 1 = debug, -1 = quiet, -3 = silent.
    #[serde(default)]
    pub verbosity: i32,
    /// Address of the event broker, `host` or `host:port`.
    pub event_broker_host: String,
    /// Base topic name; the run id is appended to form the event topic.
    pub shutdown_topic: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound for each startup wait. Unset means wait indefinitely.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    /// Program used to reach remote nodes (`ssh`, `gsissh`, ...).
    #[serde(default = "default_remote_shell")]
    pub remote_shell: String,
    /// Local staging area removed by the launcher's clean-up.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_remote_shell() -> String {
    "ssh".to_string()
}

impl OrcaConfig {
    /// Minimal config for the given broker and topic, everything else defaulted.
    pub fn new(event_broker_host: impl Into<String>, shutdown_topic: impl Into<String>) -> Self {
        Self {
            dry_run: false,
            verbosity: 0,
            event_broker_host: event_broker_host.into(),
            shutdown_topic: shutdown_topic.into(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: None,
            remote_shell: default_remote_shell(),
            staging_dir: None,
        }
    }

    /// Parse a TOML document, expand `$VAR` references and validate.
    pub fn from_toml_str(s: &str) -> OrcaResult<Self> {
        let raw: OrcaConfig =
            toml::from_str(s).map_err(|e| OrcaError::Config(format!("invalid config: {e}")))?;
        let config = raw.resolve_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> OrcaResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrcaError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    fn resolve_env(mut self) -> OrcaResult<Self> {
        self.event_broker_host = env_string::resolve(&self.event_broker_host)?;
        self.shutdown_topic = env_string::resolve(&self.shutdown_topic)?;
        self.remote_shell = env_string::resolve(&self.remote_shell)?;
        if let Some(dir) = &self.staging_dir {
            let resolved = env_string::resolve(&dir.to_string_lossy())?;
            self.staging_dir = Some(PathBuf::from(resolved));
        }
        Ok(self)
    }

    pub fn validate(&self) -> OrcaResult<()> {
        if self.event_broker_host.trim().is_empty() {
            return Err(OrcaError::Config("event_broker_host is empty".to_string()));
        }
        if self.shutdown_topic.trim().is_empty() {
            return Err(OrcaError::Config("shutdown_topic is empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(OrcaError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.remote_shell.trim().is_empty() {
            return Err(OrcaError::Config("remote_shell is empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        // Round up so a sub-millisecond remainder never shortens the wait.
        self.wait_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX));
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = OrcaConfig::from_toml_str(
            r#"
            event_broker_host = "lsst8.ncsa.uiuc.edu"
            shutdown_topic = "workflowShutdown"
            "#,
        )
        .unwrap();
        assert!(!config.dry_run);
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.wait_timeout(), None);
        assert_eq!(config.remote_shell, "ssh");
    }

    #[test]
    fn test_full_document() {
        let config = OrcaConfig::from_toml_str(
            r#"
            dry_run = true
            verbosity = -1
            event_broker_host = "broker:61616"
            shutdown_topic = "shutdown"
            poll_interval_ms = 250
            wait_timeout_ms = 600000
            remote_shell = "gsissh"
            staging_dir = "/tmp/orca-stage"
            "#,
        )
        .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.verbosity, -1);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.wait_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.remote_shell, "gsissh");
        assert_eq!(config.staging_dir, Some(PathBuf::from("/tmp/orca-stage")));
    }

    #[test]
    fn test_sub_second_wait_timeout_kept() {
        let base = OrcaConfig::new("b", "t");
        let config = base.clone().with_wait_timeout(Some(Duration::from_millis(500)));
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(500)));

        let config = base.clone().with_wait_timeout(Some(Duration::from_micros(1500)));
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(2)));

        let config = base.with_wait_timeout(Some(Duration::from_nanos(1)));
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(1)));
        assert_eq!(config.with_wait_timeout(None).wait_timeout(), None);
    }

    #[test]
    fn test_missing_broker_is_config_error() {
        let err = OrcaConfig::from_toml_str(r#"shutdown_topic = "s""#).unwrap_err();
        assert!(matches!(err, OrcaError::Config(_)));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = OrcaConfig::from_toml_str(
            r#"
            event_broker_host = "b"
            shutdown_topic = "s"
            poll_interval_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_unset_env_reference_rejected() {
        let err = OrcaConfig::from_toml_str(
            r#"
            event_broker_host = "$ORCA_TEST_SURELY_UNSET_BROKER"
            shutdown_topic = "s"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ORCA_TEST_SURELY_UNSET_BROKER"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orca.toml");
        std::fs::write(&path, "event_broker_host = \"b\"\nshutdown_topic = \"t\"\n").unwrap();
        let config = OrcaConfig::from_file(&path).unwrap();
        assert_eq!(config, OrcaConfig::new("b", "t"));
    }
}
