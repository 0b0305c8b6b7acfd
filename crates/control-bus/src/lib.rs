//! Topic bus carrying telescope control frames.
//!
//! Every telescope listens on a topic named after its identifier; a controller
//! publishes one [`ControlFrame`] per user intent. [`LocalBus`] keeps everything
//! in-process and backs tests and the console's loopback mode.

mod frame;
mod listener;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub use frame::{ControlFrame, FrameError};
pub use listener::{spawn_control_listener, ControlSink};

const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers on topic {0}")]
    NoSubscribers(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Control topic for a telescope. The identifier is used verbatim.
pub fn control_topic(telescope_id: &str) -> &str {
    telescope_id
}

/// In-memory bus with one broadcast channel per topic.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers(topic.to_string()))
    }
}
