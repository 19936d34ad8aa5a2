//! Event transport: named topics, named subscribers
//!
//! Subscriptions are registered under a subscriber name so a component can drop
//! all of its subscriptions in one call on teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::{ColorMap, ColorResult, ColorsExtractedEvent};
use crate::perceptual::CoordinationMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "colors:extracted")]
    ColorsExtracted,
    #[serde(rename = "colors:harmonized")]
    ColorsHarmonized,
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::ColorsExtracted => "colors:extracted",
            Topic::ColorsHarmonized => "colors:harmonized",
        }
    }
}

/// Outbound payload; the only externally durable contract of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorsHarmonizedEvent {
    pub processed_colors: ColorMap,
    pub accent_hex: String,
    pub accent_rgb: String,
    pub strategies_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_metrics: Option<CoordinationMetrics>,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&ColorResult> for ColorsHarmonizedEvent {
    fn from(result: &ColorResult) -> Self {
        Self {
            processed_colors: result.processed_colors.clone(),
            accent_hex: result.accent_hex.clone(),
            accent_rgb: result.accent_rgb.clone(),
            strategies_used: result.metadata.strategies_used.clone(),
            coordination_metrics: result.metadata.coordination_metrics.clone(),
            processing_time_ms: result.metadata.processing_time_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum BusEvent {
    #[serde(rename = "colors:extracted")]
    ColorsExtracted(ColorsExtractedEvent),
    #[serde(rename = "colors:harmonized")]
    ColorsHarmonized(ColorsHarmonizedEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::ColorsExtracted(_) => Topic::ColorsExtracted,
            BusEvent::ColorsHarmonized(_) => Topic::ColorsHarmonized,
        }
    }
}

pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: Topic, subscriber: &str) -> mpsc::UnboundedReceiver<BusEvent>;

    /// Returns how many subscribers received the event
    fn publish(&self, event: BusEvent) -> usize;

    /// Close every subscription registered under `subscriber`
    fn unsubscribe_all(&self, subscriber: &str) -> usize;
}

struct Subscription {
    subscriber: String,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// In-process bus over unbounded mpsc channels
#[derive(Default)]
pub struct MemoryEventBus {
    topics: Mutex<HashMap<Topic, Vec<Subscription>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(&topic).map_or(0, |subs| subs.len())
    }
}

impl EventBus for MemoryEventBus {
    fn subscribe(&self, topic: Topic, subscriber: &str) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic).or_default().push(Subscription {
            subscriber: subscriber.to_string(),
            tx,
        });
        debug!("{} subscribed to {}", subscriber, topic.as_str());
        rx
    }

    fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = topics.get_mut(&topic) else {
            return 0;
        };

        // Receivers that went away are pruned on the way through
        subs.retain(|s| s.tx.send(event.clone()).is_ok());
        subs.len()
    }

    fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for subs in topics.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.subscriber != subscriber);
            removed += before - subs.len();
        }
        debug!("{} unsubscribed from {} topics", subscriber, removed);
        removed
    }
}
