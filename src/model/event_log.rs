//! Bounded event log
//!
//! Holds the most recent events exchanged on the control channel, newest
//! first, so a front end can render them without any further sorting.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::event::Event;

/// Which side of the connection produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by us
    Client,
    /// Received from the remote model
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl LogEntry {
    pub fn new(direction: Direction, event: Event) -> LogEntry {
        Self {
            direction,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Newest-first log that evicts its oldest entry once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> EventLog {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent entry.
    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    /// Iterates newest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}
