//! In-process publish/subscribe fabric.
//!
//! The bus is a notification channel, not a transaction log: nothing is
//! persisted and a late subscriber never sees earlier events. Authoritative
//! state lives in the [`crate::registry::WorkflowRegistry`].
//!
//! # Delivery
//!
//! - `publish` returns only after its event reached every subscriber.
//!   Publishers on different threads deliver concurrently, each on its own
//!   thread; per topic, one thread's events arrive in the order it published.
//! - A handler that returns `Err` or panics is logged and counted; delivery
//!   to the remaining subscribers continues and the publisher never sees it.
//! - A handler may publish. The nested event is queued on its topic and
//!   delivered by the same `publish` call once the current one has reached
//!   every subscriber.
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//! let handle = bus.subscribe(Topic::PhaseCompleted, |event| {
//!     println!("{} entered {}", event.workflow_id, event.phase);
//!     Ok(())
//! });
//! bus.publish(Event::new(Topic::PhaseCompleted, "42", Phase::Plan, json!({})));
//! bus.unsubscribe(&handle);
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{OrchestratorError, Phase};
use crate::metrics::METRICS;

/// Event kinds carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "phase.started")]
    PhaseStarted,
    #[serde(rename = "phase.completed")]
    PhaseCompleted,
    #[serde(rename = "gate.failed")]
    GateFailed,
    #[serde(rename = "handoff.ready")]
    HandoffReady,
    #[serde(rename = "handoff.rejected")]
    HandoffRejected,
    #[serde(rename = "workflow.terminated")]
    WorkflowTerminated,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::PhaseStarted,
        Topic::PhaseCompleted,
        Topic::GateFailed,
        Topic::HandoffReady,
        Topic::HandoffRejected,
        Topic::WorkflowTerminated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::PhaseStarted => "phase.started",
            Topic::PhaseCompleted => "phase.completed",
            Topic::GateFailed => "gate.failed",
            Topic::HandoffReady => "handoff.ready",
            Topic::HandoffRejected => "handoff.rejected",
            Topic::WorkflowTerminated => "workflow.terminated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| OrchestratorError::Configuration(format!("unknown topic: {s}")))
    }
}

/// Immutable value broadcast on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: Topic,
    pub workflow_id: String,
    pub phase: Phase,
    /// Opaque to the bus.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        topic: Topic,
        workflow_id: impl Into<String>,
        phase: Phase,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            workflow_id: workflow_id.into(),
            phase,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Handler signature. Errors are isolated like panics.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

struct Subscriber {
    id: Uuid,
    handler: Handler,
}

/// An event plus the subscribers registered when it was published.
struct Pending {
    event: Event,
    recipients: Arc<[Arc<Subscriber>]>,
}

#[derive(Default)]
struct TopicChannel {
    subscribers: Vec<Arc<Subscriber>>,
    /// Re-entrant events queued by handlers, keyed by the thread whose
    /// `publish` call is delivering this topic.
    draining: HashMap<ThreadId, VecDeque<Pending>>,
}

/// Typed publish/subscribe channel.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<Topic, TopicChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Topic, TopicChannel>> {
        // Handlers never run under this lock, so poisoning only follows a
        // panic in the bookkeeping below; the map is still consistent.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.channels()
            .entry(topic)
            .or_default()
            .subscribers
            .push(Arc::new(Subscriber {
                id,
                handler: Arc::new(handler),
            }));
        debug!(topic = %topic, subscription = %id, "subscribed");
        SubscriptionHandle { id, topic }
    }

    /// Subscribe one handler to every topic.
    pub fn subscribe_all(&self, handler: Handler) -> Vec<SubscriptionHandle> {
        Topic::ALL
            .into_iter()
            .map(|topic| {
                let handler = Arc::clone(&handler);
                self.subscribe(topic, move |event| handler(event))
            })
            .collect()
    }

    /// Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&handle.topic) else {
            return false;
        };
        let before = channel.subscribers.len();
        channel.subscribers.retain(|s| s.id != handle.id);
        before != channel.subscribers.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels()
            .get(&topic)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Fan `event` out to the subscribers of its topic.
    ///
    /// Returns once the event has been delivered. A call made from inside a
    /// handler on the same topic queues the event for the outer call
    /// instead, which delivers it before returning.
    pub fn publish(&self, event: Event) {
        let topic = event.topic;
        let me = thread::current().id();
        let first = {
            let mut channels = self.channels();
            let channel = channels.entry(topic).or_default();
            let recipients: Arc<[Arc<Subscriber>]> = channel.subscribers.iter().cloned().collect();
            let pending = Pending { event, recipients };
            if let Some(queue) = channel.draining.get_mut(&me) {
                queue.push_back(pending);
                return;
            }
            channel.draining.insert(me, VecDeque::new());
            pending
        };

        let mut next = Some(first);
        while let Some(pending) = next {
            for subscriber in pending.recipients.iter() {
                deliver(subscriber, &pending.event);
            }
            let mut channels = self.channels();
            let channel = channels.entry(topic).or_default();
            next = channel.draining.get_mut(&me).and_then(VecDeque::pop_front);
            if next.is_none() {
                channel.draining.remove(&me);
            }
        }
    }
}

fn deliver(subscriber: &Subscriber, event: &Event) {
    let result = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event)));
    let fault = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
    };
    METRICS.inc_subscriber_faults();
    warn!(
        topic = %event.topic,
        workflow_id = %event.workflow_id,
        subscription = %subscriber.id,
        error = %fault,
        "bus subscriber failed; continuing delivery"
    );
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Subscriber that mirrors every bus event into `tracing`.
pub struct TracingSink;

impl TracingSink {
    pub fn attach(bus: &EventBus) -> Vec<SubscriptionHandle> {
        bus.subscribe_all(Arc::new(|event: &Event| {
            info!(
                event = "bus",
                topic = %event.topic,
                workflow_id = %event.workflow_id,
                phase = %event.phase,
                payload = %event.payload,
            );
            Ok(())
        }))
    }
}
