//! Process-wide publish/subscribe bus.
//!
//! Two delivery paths share one publish call: registered in-process handlers
//! are invoked synchronously in registration order (per-topic FIFO relative
//! to a single publisher), and a broadcast channel feeds push-stream
//! consumers such as socket subscribers. Handlers run against a snapshot of
//! the registration list, so a handler may subscribe, unsubscribe, or
//! publish again without deadlocking the bus.

use crate::models::Queue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

/// Named topics emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "tasks:user:changed")]
    TasksUserChanged,
    #[serde(rename = "tasks:internal:changed")]
    TasksInternalChanged,
    #[serde(rename = "agent:spawned")]
    AgentSpawned,
    #[serde(rename = "agent:output")]
    AgentOutput,
    #[serde(rename = "agent:completed")]
    AgentCompleted,
    #[serde(rename = "health:check")]
    HealthCheck,
    #[serde(rename = "log")]
    Log,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::TasksUserChanged => "tasks:user:changed",
            Topic::TasksInternalChanged => "tasks:internal:changed",
            Topic::AgentSpawned => "agent:spawned",
            Topic::AgentOutput => "agent:output",
            Topic::AgentCompleted => "agent:completed",
            Topic::HealthCheck => "health:check",
            Topic::Log => "log",
        }
    }

    pub fn tasks_changed(queue: Queue) -> Self {
        match queue {
            Queue::User => Topic::TasksUserChanged,
            Queue::Internal => Topic::TasksInternalChanged,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Topic::Status),
            "tasks:user:changed" => Ok(Topic::TasksUserChanged),
            "tasks:internal:changed" => Ok(Topic::TasksInternalChanged),
            "agent:spawned" => Ok(Topic::AgentSpawned),
            "agent:output" => Ok(Topic::AgentOutput),
            "agent:completed" => Ok(Topic::AgentCompleted),
            "health:check" => Ok(Topic::HealthCheck),
            "log" => Ok(Topic::Log),
            _ => Err(format!("Unknown topic: {s}")),
        }
    }
}

/// One published event: topic plus free-form JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            payload,
            at: Utc::now(),
        }
    }
}

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `subscribe`; pass to `unsubscribe` to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>>,
    next_id: Arc<AtomicU64>,
    stream_tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (stream_tx, _) = broadcast::channel(crate::constants::EVENT_STREAM_CAPACITY);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            stream_tx,
        }
    }

    /// Register a handler for one topic. Handlers are invoked synchronously
    /// in registration order; a returned error is logged, never propagated.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(topic).or_default().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for list in handlers.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Fan an event out to every handler registered for its topic, then to
    /// stream subscribers. Dispatch iterates a snapshot, so handlers may
    /// mutate the registration list or publish further events.
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let event = Event::new(topic, payload);

        let snapshot: Vec<(SubscriptionId, Handler)> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&topic).cloned().unwrap_or_default()
        };

        for (id, handler) in snapshot {
            if let Err(e) = handler(&event) {
                warn!(topic = %topic, subscription = id.0, error = %e, "event handler failed");
            }
        }

        // Nobody listening is fine; broadcast send only errors then.
        let _ = self.stream_tx.send(event);
    }

    /// A live receiver of every published event, for push-stream consumers.
    /// Laggy receivers skip missed events rather than blocking publishers.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<Event> {
        self.stream_tx.subscribe()
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&topic).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
