//! Bounded buffer of recent backend stderr output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Ring buffer keeping the last `capacity` diagnostic lines.
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest-first copy of the retained lines.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_most_recent_lines() {
        let buf = DiagnosticBuffer::new(2);
        buf.push("one".into());
        buf.push("two".into());
        buf.push("three".into());
        assert_eq!(buf.snapshot(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let buf = DiagnosticBuffer::new(0);
        buf.push("ignored".into());
        assert!(buf.snapshot().is_empty());
    }
}
