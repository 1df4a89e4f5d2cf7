use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for orca.
///
/// Each variant corresponds to one class of failure the launch-and-monitor
/// subsystem can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum OrcaError {
    /// Bad or missing configuration, detected before anything is spawned.
    #[error("Config error: {0}")]
    Config(String),

    /// A job could not be spawned or submitted.
    #[error("Launch error: job #{index} ({program}{}) failed: {reason}", target_suffix(.target))]
    Launch {
        /// Position of the failing job in the launch order.
        index: usize,
        /// The program the job tried to run.
        program: String,
        /// The node the job was sent to, if remote.
        target: Option<String>,
        /// Human-readable failure cause.
        reason: String,
    },

    /// The sentinel-check mechanism itself failed while waiting for startup.
    #[error("Sync error: {0}")]
    Sync(String),

    /// A bounded startup wait elapsed before every expected file appeared.
    #[error("Sync timeout after {waited:?}: still missing {missing:?}")]
    SyncTimeout {
        /// How long the waiter polled.
        waited: Duration,
        /// Files that had not appeared when the wait gave up.
        missing: Vec<PathBuf>,
    },

    /// The event feed could not be reached or subscribed to.
    #[error("Feed error: {0}")]
    Feed(String),

    /// An established event feed connection was lost.
    #[error("Feed disconnected: {0}")]
    FeedDisconnected(String),

    /// Lock protocol misuse on shared data (unmatched release, double init).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Shared data accessed without holding its lock.
    #[error("Access error: {0}")]
    Access(String),

    /// Shared data field that was never declared.
    #[error("Undeclared field: {0}")]
    UndeclaredField(String),

    /// Misuse of a workflow monitor (e.g. starting it twice).
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn target_suffix(target: &Option<String>) -> String {
    match target {
        Some(host) => format!(" on {host}"),
        None => String::new(),
    }
}

/// A convenience `Result` alias using [`OrcaError`].
pub type OrcaResult<T> = Result<T, OrcaError>;
