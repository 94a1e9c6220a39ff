//! Bounded in-process event history for resync after a missed broadcast

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::types::{ProgressEvent, ProgressStage};

/// Default number of events retained
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Ring buffer of the most recent progress events
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<ProgressEvent>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest when full
    pub fn push(&mut self, event: ProgressEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All retained events, oldest first
    pub fn all(&self) -> Vec<ProgressEvent> {
        self.events.iter().cloned().collect()
    }

    /// Retained events for one job, oldest first
    pub fn for_job(&self, job_id: &str) -> Vec<ProgressEvent> {
        self.events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Events strictly newer than `since`
    pub fn since(&self, since: DateTime<Utc>) -> Vec<ProgressEvent> {
        self.events
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect()
    }

    /// Most recent event for a job
    pub fn latest(&self, job_id: &str) -> Option<ProgressEvent> {
        self.events.iter().rev().find(|e| e.job_id == job_id).cloned()
    }

    /// Per-stage counts for a job
    pub fn stats(&self, job_id: &str) -> EventStats {
        let mut stats = EventStats::default();
        for event in self.events.iter().filter(|e| e.job_id == job_id) {
            stats.total += 1;
            match event.stage {
                ProgressStage::Integrated => stats.integrated += 1,
                ProgressStage::Exhausted => stats.exhausted += 1,
                ProgressStage::ChapterSkipped => stats.skipped += 1,
                ProgressStage::Refining => stats.refinements += 1,
                _ => {}
            }
        }
        stats
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Summary counts over a job's retained events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub total: usize,
    pub integrated: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub refinements: usize,
}
