//! Operational event log
//!
//! Records user-visible lifecycle events (attach, detach, bad replicas,
//! background task results) in a bounded in-memory ring. One log is created
//! at startup and handed to the manager, monitors and controllers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

pub struct EventLog {
    entries: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Record an event, evicting the oldest one when full
    pub fn log(&self, level: EventLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            EventLevel::Info => tracing::info!(event = true, "{}", message),
            EventLevel::Warn => tracing::warn!(event = true, "{}", message),
            EventLevel::Error => tracing::error!(event = true, "{}", message),
        }
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(Event {
                timestamp: Utc::now(),
                level,
                message,
            });
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(EventLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(EventLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(EventLevel::Error, message)
    }

    /// Oldest first
    pub fn list(&self) -> Vec<Event> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }
}
