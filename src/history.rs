//! Line history for the line editor
//!
//! Lives for one process only; nothing is written to disk.

use std::collections::VecDeque;

/// Default number of history entries
pub const HISTORY_LIMIT: usize = 500;

/// Submitted lines, oldest first
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<String>,
    max_entries: usize,
}

impl History {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    /// Record a submitted line; empty lines are ignored
    pub fn add(&mut self, line: &str) {
        if line.is_empty() || self.max_entries == 0 {
            return;
        }

        self.entries.push_back(line.to_string());

        // Trim if exceeding limit
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Entry by age, 0 being the oldest
    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}
