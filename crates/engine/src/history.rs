//! Bounded per-engine command log with FIFO eviction.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::command::CommandKind;

/// How a completed command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded,
    Failed(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One completed command.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Per-engine sequence number assigned at submission.
    pub seq: u64,
    pub kind: CommandKind,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CommandOutcome,
}

impl HistoryEntry {
    /// Wall time between start and finish, if the command ever started.
    pub fn duration_ms(&self) -> Option<i64> {
        self.started_at
            .map(|started| (self.finished_at - started).num_milliseconds())
    }
}

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    /// A limit of zero keeps nothing.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Entry for `seq`, if it has not been evicted.
    pub fn get(&self, seq: u64) -> Option<&HistoryEntry> {
        // Sequence numbers are appended in completion order, which for a FIFO
        // queue is submission order, except for cleared commands logged early.
        self.entries.iter().rev().find(|e| e.seq == seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
