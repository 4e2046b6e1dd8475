#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-bus** – the in-process event bus that carries task, agent
//! process, and human-queue lifecycle notifications between
//! `bloom-store`, `bloom-agent-runtime`, `bloom-queue`, and whatever is
//! watching them (a CLI status line, a future web UI).
//!
//! This crate has no persistence or I/O concerns of its own: it is a
//! thin broadcast layer. Delivery is at-most-once per subscriber — a
//! slow subscriber misses events rather than stalling publishers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// All events the system publishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BloomEvent {
    /// A task moved from one status to another.
    TaskStateChanged {
        /// Task id.
        id: String,
        /// Previous status, rendered as its wire name.
        from: String,
        /// New status, rendered as its wire name.
        to: String,
    },
    /// A task was claimed by an agent.
    TaskAssigned {
        /// Task id.
        id: String,
        /// Name of the agent the task was assigned to.
        agent_name: String,
    },
    /// A chunk of raw or rendered output was produced by a running
    /// agent process.
    AgentOutput {
        /// Name of the agent that produced the chunk.
        agent_name: String,
        /// The output chunk.
        chunk: String,
    },
    /// An agent subprocess was spawned.
    AgentProcessStarted {
        /// Name of the agent.
        agent_name: String,
        /// OS process id.
        pid: u32,
        /// Command that was spawned, for diagnostics.
        command: String,
    },
    /// An agent subprocess exited.
    AgentProcessEnded {
        /// Name of the agent.
        agent_name: String,
        /// OS process id.
        pid: u32,
        /// Process exit code, if the process exited normally.
        exit_code: Option<i32>,
    },
    /// A question was added to the human queue.
    QuestionCreated {
        /// Question id.
        id: String,
    },
    /// A question was answered.
    QuestionAnswered {
        /// Question id.
        id: String,
        /// The answer text.
        answer: String,
    },
    /// An interjection was filed against a running or queued task.
    InterjectionCreated {
        /// Interjection id.
        id: String,
        /// Task id the interjection targets.
        task_id: String,
    },
    /// A paused task resumed after an interjection was addressed.
    InterjectionResumed {
        /// Interjection id.
        id: String,
        /// Task id the interjection targeted.
        task_id: String,
    },
}

/// Publish/subscribe abstraction over [`BloomEvent`].
///
/// Implementations must be thread-safe and support multiple concurrent
/// subscribers. Publish must not block on subscriber behavior.
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers.
    ///
    /// Slow or absent subscribers never cause this to block or fail;
    /// they simply miss the event once the ring buffer wraps.
    fn publish(&self, event: BloomEvent);

    /// Subscribe to the live event stream. Only events published after
    /// this call are visible to the returned receiver.
    fn subscribe(&self) -> broadcast::Receiver<BloomEvent>;
}

/// In-memory, broadcast-only event bus.
///
/// Backed by a `tokio::sync::broadcast` ring buffer. Once the buffer
/// capacity is exceeded, the slowest subscribers start seeing
/// `RecvError::Lagged` instead of stalling publishers — the bus never
/// blocks and never disconnects a subscriber merely for falling
/// behind.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<BloomEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a bus with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of currently live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: BloomEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<BloomEvent> {
        self.tx.subscribe()
    }
}

/// Errors surfaced by bus-adjacent glue code (not by the bus itself,
/// which never fails to publish).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A subscriber task could not be spawned.
    #[error("failed to create subscription: {0}")]
    SubscriptionFailed(String),
}
