use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle milestones stamped on an event as it moves through a path's
/// processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleInstant {
    AddedToQueue,
    StartedProcessing,
    FinishedProcessingSuccessfully,
    FinishedProcessingWithError,
}

/// One received webhook delivery: raw payload plus transport headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub trace_id: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timestamps: BTreeMap<LifecycleInstant, DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WebhookEvent {
    pub fn new(payload: serde_json::Value, headers: HashMap<String, String>) -> Self {
        Self {
            trace_id: ulid::Ulid::new().to_string(),
            payload,
            headers,
            timestamps: BTreeMap::new(),
            retry_count: 0,
        }
    }

    pub fn record(&mut self, instant: LifecycleInstant) {
        self.timestamps.insert(instant, Utc::now());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
