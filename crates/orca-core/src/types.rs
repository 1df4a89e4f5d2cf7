use crate::error::{OrcaError, OrcaResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Name of one concurrently-running pipeline, unique within a run.
pub type PipelineName = String;

/// Opaque identifier of one workflow execution.
///
/// Scopes all file, topic and directory naming for the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A resolved job handed over by the configurator.
///
/// Immutable once created: the launcher only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Remote host to run on; `None` runs the job locally.
    #[serde(default)]
    pub target_node: Option<String>,
    /// Directory the job starts in.
    pub working_dir: PathBuf,
}

impl JobDescriptor {
    pub fn new<I, S>(command: I, working_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            target_node: None,
            working_dir: working_dir.into(),
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.target_node = Some(node.into());
        self
    }

    /// The program to execute, or `""` for an empty command.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    pub fn is_remote(&self) -> bool {
        self.target_node.is_some()
    }

    /// Check the fields the launcher relies on. Command semantics are not inspected.
    pub fn validate(&self) -> OrcaResult<()> {
        if self.program().trim().is_empty() {
            return Err(OrcaError::Config(
                "job descriptor has an empty command".to_string(),
            ));
        }
        if let Some(node) = &self.target_node {
            if node.trim().is_empty() {
                return Err(OrcaError::Config(format!(
                    "job '{}' has an empty target node",
                    self.program()
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of a single pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Starting,
    Running,
    Done,
    Failed,
}

impl PipelineState {
    /// DONE and FAILED absorb every later event.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Whether moving from `self` to `next` is a real forward transition.
    ///
    /// Repeats, regressions and anything after a terminal state are not.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        match (self, next) {
            (PipelineState::Starting, PipelineState::Running)
            | (PipelineState::Starting, PipelineState::Done)
            | (PipelineState::Starting, PipelineState::Failed)
            | (PipelineState::Running, PipelineState::Done)
            | (PipelineState::Running, PipelineState::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Starting => write!(f, "STARTING"),
            PipelineState::Running => write!(f, "RUNNING"),
            PipelineState::Done => write!(f, "DONE"),
            PipelineState::Failed => write!(f, "FAILED"),
        }
    }
}

/// A status event published by a remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub pipeline_name: PipelineName,
    pub run_id: RunId,
    pub state: PipelineState,
    pub timestamp: DateTime<Utc>,
    pub source_host: String,
}

impl WorkflowStatus {
    pub fn new(
        run_id: RunId,
        pipeline_name: impl Into<String>,
        state: PipelineState,
        source_host: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id,
            state,
            timestamp: Utc::now(),
            source_host: source_host.into(),
        }
    }
}

/// Overall state of a monitored workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// At least one pipeline has not reached a terminal state.
    Active,
    /// Every pipeline reached DONE or FAILED.
    Complete,
    /// Monitoring was stopped by the caller.
    Cancelled,
    /// The monitor lost its event feed.
    Failed,
}

impl WorkflowState {
    pub fn is_finished(self) -> bool {
        !matches!(self, WorkflowState::Active)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Active => write!(f, "ACTIVE"),
            WorkflowState::Complete => write!(f, "COMPLETE"),
            WorkflowState::Cancelled => write!(f, "CANCELLED"),
            WorkflowState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Aggregate outcome handed to listeners when a workflow finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub pipelines: BTreeMap<PipelineName, PipelineState>,
    /// Set when the monitor itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowReport {
    /// Pipelines that finished in the given state.
    pub fn pipelines_in(&self, state: PipelineState) -> Vec<&str> {
        self.pipelines
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// True when the workflow completed and no pipeline failed.
    pub fn is_success(&self) -> bool {
        self.state == WorkflowState::Complete
            && self.pipelines.values().all(|s| *s == PipelineState::Done)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_forward_only() {
        use PipelineState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Done));
        assert!(!Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        for next in [Starting, Running, Done, Failed] {
            assert!(!Done.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_wire_format() {
        let json = r#"{
            "pipelineName": "ccdAssembly_1",
            "runId": "rlp0042",
            "state": "RUNNING",
            "timestamp": "2010-03-01T12:00:00Z",
            "sourceHost": "lsst5"
        }"#;
        let status: WorkflowStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.pipeline_name, "ccdAssembly_1");
        assert_eq!(status.run_id, RunId::new("rlp0042"));
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(status.source_host, "lsst5");
    }

    #[test]
    fn test_status_rejects_unknown_state() {
        let json = r#"{"pipelineName":"p","runId":"r","state":"PAUSED",
            "timestamp":"2010-03-01T12:00:00Z","sourceHost":"h"}"#;
        assert!(serde_json::from_str::<WorkflowStatus>(json).is_err());
    }

    #[test]
    fn test_job_descriptor_accessors() {
        let job = JobDescriptor::new(["runPipeline.sh", "-v", "policy.paf"], "/work")
            .on_node("node03");
        assert_eq!(job.program(), "runPipeline.sh");
        assert_eq!(job.args(), ["-v", "policy.paf"]);
        assert!(job.is_remote());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_job_descriptor_empty_command_is_config_error() {
        let job = JobDescriptor::new(Vec::<String>::new(), "/work");
        assert_eq!(job.program(), "");
        assert!(job.args().is_empty());
        assert!(matches!(job.validate(), Err(OrcaError::Config(_))));
    }

    #[test]
    fn test_report_success_and_partition() {
        let mut pipelines = BTreeMap::new();
        pipelines.insert("p1".to_string(), PipelineState::Done);
        pipelines.insert("p2".to_string(), PipelineState::Failed);
        let report = WorkflowReport {
            run_id: RunId::new("r1"),
            state: WorkflowState::Complete,
            pipelines,
            error: None,
        };
        assert!(!report.is_success());
        assert_eq!(report.pipelines_in(PipelineState::Failed), vec!["p2"]);
    }
}
