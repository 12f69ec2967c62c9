//! Event bus adapter.
//!
//! The harness publishes one value on [`TOPIC_STATISTIC`] per completed
//! periodic batch. Progress and classical calibration results are never
//! published.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::harness::{BatchOutcome, ResultOrigin};

/// Topic carrying the CHSH statistic.
pub const TOPIC_STATISTIC: &str = "S";

/// Publish side of an external event bus.
pub trait EventBus: Send + 'static {
    fn publish(&self, topic: &str, value: f64);

    /// Publish a tagged batch outcome. The default forwards only the scalar;
    /// buses that filter on data quality can override it to keep the tag.
    fn publish_outcome(&self, topic: &str, outcome: &BatchOutcome) {
        self.publish(topic, outcome.result.statistic);
    }
}

/// One published value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub topic: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ResultOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within_physical_limit: Option<bool>,
}

const MAX_RETAINED: usize = 1024;

#[derive(Default)]
struct BusInner {
    events: VecDeque<BusEvent>,
    subscribers: Vec<(String, Sender<BusEvent>)>,
}

/// In-process bus with per-topic subscriptions and a bounded event log.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every future event on `topic`.
    pub fn subscribe(&self, topic: &str) -> Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push((topic.to_string(), tx));
        rx
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Retained values for one topic, oldest first.
    pub fn values(&self, topic: &str) -> Vec<f64> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.value)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BusEvent) {
        let mut inner = self.lock();
        // Dropped receivers are pruned here.
        inner
            .subscribers
            .retain(|(topic, tx)| *topic != event.topic || tx.send(event.clone()).is_ok());
        inner.events.push_back(event);
        if inner.events.len() > MAX_RETAINED {
            inner.events.pop_front();
        }
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, topic: &str, value: f64) {
        self.emit(BusEvent {
            topic: topic.to_string(),
            value,
            origin: None,
            sequence: None,
            within_physical_limit: None,
        });
    }

    fn publish_outcome(&self, topic: &str, outcome: &BatchOutcome) {
        self.emit(BusEvent {
            topic: topic.to_string(),
            value: outcome.result.statistic,
            origin: Some(outcome.origin),
            sequence: Some(outcome.sequence),
            within_physical_limit: Some(outcome.result.within_physical_limit),
        });
    }
}
