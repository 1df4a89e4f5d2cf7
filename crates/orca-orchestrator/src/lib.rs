//! Workflow launching, startup synchronization and event-driven monitoring.
//!
//! A workflow is a set of jobs started on one or more nodes. The launcher
//! spawns them, waits for their sentinel files to appear and then hands the
//! run over to a monitor that follows pipeline status events until every
//! pipeline reaches a terminal state.
//!
//! # Main types
//!
//! - [`WorkflowLauncher`] — Spawns jobs, synchronizes on startup and returns a monitor.
//! - [`WorkflowMonitor`] — Tracks per-pipeline state from the event feed.
//! - [`FileWaiter`] — Polls for sentinel files locally or over the remote shell.
//! - [`JobSpawner`] — Seam for starting one job (process or batch submit).
//! - [`EventFeed`] — Seam for subscribing to a run's status topic.

/// Child process helpers and remote shell command building.
pub mod exec;
/// Status event feeds: in-memory broker and TCP line feed.
pub mod feed;
/// Sentinel file polling.
pub mod file_waiter;
/// Workflow launch sequence.
pub mod launcher;
/// Event-driven workflow monitor.
pub mod monitor;
/// Job spawning strategies.
pub mod spawner;

pub use feed::{EventFeed, EventTopic, FeedSubscription, MemoryBroker, TcpLineFeed};
pub use file_waiter::{FileProbe, FileWaiter, LocalProbe, RemoteShellProbe};
pub use launcher::WorkflowLauncher;
pub use monitor::{ListenerId, StatusListener, WorkflowMonitor};
pub use spawner::{JobSpawner, ProcessSpawner, SpawnedJob, SubmitSpawner};
