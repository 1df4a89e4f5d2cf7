//! Event feed abstraction used by the workflow monitor.
//!
//! A feed hands out per-topic subscriptions yielding raw payload strings.
//! Parsing is the monitor's job, so a garbled payload never takes the
//! subscription down; an `Err` from [`FeedSubscription::next_payload`] always
//! means the connection itself is gone.

use async_trait::async_trait;
use orca_core::{OrcaConfig, OrcaError, OrcaResult, RunId, WorkflowStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Where a run's status events are published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTopic {
    pub broker_host: String,
    pub name: String,
}

impl EventTopic {
    /// Topic for one run: `<shutdown_topic>.<run_id>` on `broker_host`.
    pub fn for_run(broker_host: &str, shutdown_topic: &str, run_id: &RunId) -> Self {
        Self {
            broker_host: broker_host.to_string(),
            name: format!("{shutdown_topic}.{run_id}"),
        }
    }

    pub fn from_config(config: &OrcaConfig, run_id: &RunId) -> Self {
        Self::for_run(&config.event_broker_host, &config.shutdown_topic, run_id)
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.broker_host)
    }
}

/// A source of per-topic subscriptions.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn subscribe(&self, topic: &EventTopic) -> OrcaResult<Box<dyn FeedSubscription>>;
}

/// A live subscription. Dropping it releases the subscription.
#[async_trait]
pub trait FeedSubscription: Send {
    /// Next raw payload, in arrival order.
    ///
    /// Must be cancel safe: the monitor races it against its stop signal.
    async fn next_payload(&mut self) -> OrcaResult<String>;
}

#[derive(Debug, Clone)]
enum BrokerItem {
    Payload(String),
    Disconnect(String),
}

/// In-process broker with one broadcast channel per topic.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<BrokerItem>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Each subscriber may fall `capacity` messages behind before it starts
    /// losing the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &EventTopic) -> broadcast::Sender<BrokerItem> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.name.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a raw payload; returns how many subscribers received it.
    pub fn publish(&self, topic: &EventTopic, payload: impl Into<String>) -> usize {
        self.sender(topic)
            .send(BrokerItem::Payload(payload.into()))
            .unwrap_or(0)
    }

    pub fn publish_status(&self, topic: &EventTopic, status: &WorkflowStatus) -> OrcaResult<usize> {
        let payload = serde_json::to_string(status)?;
        Ok(self.publish(topic, payload))
    }

    /// Sever every current subscription on `topic`, as a dropped broker
    /// connection would.
    pub fn disconnect(&self, topic: &EventTopic, reason: impl Into<String>) -> usize {
        self.sender(topic)
            .send(BrokerItem::Disconnect(reason.into()))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &EventTopic) -> usize {
        self.topics
            .lock()
            .get(&topic.name)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventFeed for MemoryBroker {
    async fn subscribe(&self, topic: &EventTopic) -> OrcaResult<Box<dyn FeedSubscription>> {
        let rx = self.sender(topic).subscribe();
        debug!(topic = %topic, "memory subscription opened");
        Ok(Box::new(MemorySubscription {
            topic: topic.name.clone(),
            rx,
        }))
    }
}

struct MemorySubscription {
    topic: String,
    rx: broadcast::Receiver<BrokerItem>,
}

#[async_trait]
impl FeedSubscription for MemorySubscription {
    async fn next_payload(&mut self) -> OrcaResult<String> {
        loop {
            match self.rx.recv().await {
                Ok(BrokerItem::Payload(payload)) => return Ok(payload),
                Ok(BrokerItem::Disconnect(reason)) => {
                    return Err(OrcaError::FeedDisconnected(reason));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(OrcaError::FeedDisconnected(format!(
                        "topic {} closed",
                        self.topic
                    )));
                }
            }
        }
    }
}

/// Feed over a plain TCP connection to the broker.
///
/// After connecting the client sends `SUBSCRIBE <topic>\n`; the broker then
/// streams one JSON payload per line.
pub struct TcpLineFeed {
    default_port: u16,
}

impl TcpLineFeed {
    /// Port used when the broker host carries none.
    pub const DEFAULT_PORT: u16 = 61613;

    pub fn new() -> Self {
        Self {
            default_port: Self::DEFAULT_PORT,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    fn address(&self, broker_host: &str) -> String {
        if broker_host.contains(':') {
            broker_host.to_string()
        } else {
            format!("{broker_host}:{}", self.default_port)
        }
    }
}

impl Default for TcpLineFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventFeed for TcpLineFeed {
    async fn subscribe(&self, topic: &EventTopic) -> OrcaResult<Box<dyn FeedSubscription>> {
        let addr = self.address(&topic.broker_host);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| OrcaError::Feed(format!("cannot reach broker {addr}: {e}")))?;
        let (read, mut write) = stream.into_split();
        write
            .write_all(format!("SUBSCRIBE {}\n", topic.name).as_bytes())
            .await
            .map_err(|e| OrcaError::Feed(format!("subscribe to {topic} failed: {e}")))?;
        info!(broker = %addr, topic = %topic.name, "subscribed to event topic");
        Ok(Box::new(TcpSubscription {
            lines: BufReader::new(read).lines(),
            _write: write,
        }))
    }
}

struct TcpSubscription {
    lines: Lines<BufReader<OwnedReadHalf>>,
    _write: OwnedWriteHalf,
}

#[async_trait]
impl FeedSubscription for TcpSubscription {
    async fn next_payload(&mut self) -> OrcaResult<String> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(line),
                Ok(None) => {
                    return Err(OrcaError::FeedDisconnected(
                        "broker closed the connection".to_string(),
                    ));
                }
                Err(e) => return Err(OrcaError::FeedDisconnected(e.to_string())),
            }
        }
    }
}
