//! Bounded per-source error history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of retained errors per source.
pub const DEFAULT_CAPACITY: usize = 10;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Ring buffer of the most recent errors. The oldest entry is evicted when
/// the log is full.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
    capacity: usize,
    total: u64,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ErrorEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.total += 1;
    }

    pub fn last(&self) -> Option<&ErrorEntry> {
        self.entries.back()
    }

    /// Errors recorded since creation, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut log = ErrorLog::new(3);
        for i in 0..5 {
            log.push(format!("error {}", i));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.total(), 5);
        let messages: Vec<_> = log.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
        assert_eq!(log.last().unwrap().message, "error 4");
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut log = ErrorLog::new(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.len(), 1);
    }
}
