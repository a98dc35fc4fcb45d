//! Bounded log of SFU request/response exchanges for diagnostics

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Direction of a recorded exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Request,
    Response,
}

/// One recorded request or response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Whether this records the outgoing request or the incoming response
    pub kind: HistoryKind,
    /// Endpoint path relative to the API prefix
    pub endpoint: String,
    /// HTTP method of the exchange
    pub method: String,
    /// Parsed JSON body (null when the body was empty or unparseable)
    pub body: serde_json::Value,
}

/// Ring buffer of [`HistoryEntry`] records, oldest dropped first
#[derive(Debug)]
pub struct RequestHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Record an entry, evicting the oldest when at capacity
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy out the current contents, oldest first
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
