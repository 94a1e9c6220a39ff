//! Progress bus
//!
//! Tokio broadcast fan-out plus a bounded history. Subscribers that lag or
//! join late resync from the history; job status in the store stays
//! authoritative.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::history::{EventHistory, DEFAULT_HISTORY_CAPACITY};
use super::types::{ProgressEvent, ProgressStage};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Error type for progress bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event history lock poisoned")]
    LockPoisoned,
}

/// Result type for progress bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to ProgressBus
pub type SharedProgressBus = Arc<ProgressBus>;

/// Broadcast bus for [`ProgressEvent`]s
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
    history: Mutex<EventHistory>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(EventHistory::new(capacity)),
        }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedProgressBus {
        Arc::new(self)
    }

    /// Record an event and broadcast it to current subscribers
    pub fn publish(&self, event: ProgressEvent) -> EventBusResult<()> {
        self.history
            .lock()
            .map_err(|_| EventBusError::LockPoisoned)?
            .push(event.clone());

        let stage = event.stage;
        let job_id = event.job_id.clone();
        match self.sender.send(event) {
            Ok(count) => debug!(job_id = %job_id, %stage, receivers = count, "Progress published"),
            // No receivers is fine; the history still has it
            Err(_) => debug!(job_id = %job_id, %stage, "Progress published (no receivers)"),
        }
        Ok(())
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to one job, optionally to a subset of stages
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Retained events for a job, oldest first
    pub fn replay(&self, job_id: &str) -> EventBusResult<Vec<ProgressEvent>> {
        Ok(self
            .history
            .lock()
            .map_err(|_| EventBusError::LockPoisoned)?
            .for_job(job_id))
    }

    /// Snapshot of the whole history
    pub fn history(&self) -> EventBusResult<EventHistory> {
        Ok(self
            .history
            .lock()
            .map_err(|_| EventBusError::LockPoisoned)?
            .clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub job_id: Option<String>,
    pub stages: Option<Vec<ProgressStage>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn stages(mut self, stages: Vec<ProgressStage>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn matches(&self, event: &ProgressEvent) -> bool {
        if let Some(ref jid) = self.job_id {
            if &event.job_id != jid {
                return false;
            }
        }
        if let Some(ref stages) = self.stages {
            if !stages.contains(&event.stage) {
                return false;
            }
        }
        true
    }
}

/// Receiver that only yields events matching a filter
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<ProgressEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<ProgressEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<ProgressEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = ProgressBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(ProgressEvent::new("job-1", ProgressStage::JobStarted, 0, "start"))
            .unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.stage, ProgressStage::JobStarted);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = ProgressBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ProgressEvent::new("job-1", ProgressStage::Planning, 0, ""))
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[test]
    fn test_publish_without_subscribers_is_retained() {
        let bus = ProgressBus::new();
        bus.publish(ProgressEvent::new("job-1", ProgressStage::JobStarted, 0, ""))
            .unwrap();
        bus.publish(ProgressEvent::new("job-2", ProgressStage::JobStarted, 0, ""))
            .unwrap();

        assert_eq!(bus.replay("job-1").unwrap().len(), 1);
        assert_eq!(bus.history().unwrap().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = ProgressBus::with_history_capacity(4);
        for _ in 0..10 {
            bus.publish(ProgressEvent::new("job-1", ProgressStage::Drafting, 0, ""))
                .unwrap();
        }
        assert_eq!(bus.replay("job-1").unwrap().len(), 4);
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .job("job-1")
            .stages(vec![ProgressStage::Integrated, ProgressStage::Exhausted]);

        assert!(filter.matches(&ProgressEvent::new("job-1", ProgressStage::Integrated, 33, "")));
        assert!(!filter.matches(&ProgressEvent::new("job-2", ProgressStage::Integrated, 33, "")));
        assert!(!filter.matches(&ProgressEvent::new("job-1", ProgressStage::Planning, 0, "")));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = ProgressBus::new().shared();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().job("target"));

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher
                .publish(ProgressEvent::new("other", ProgressStage::JobStarted, 0, ""))
                .unwrap();
            publisher
                .publish(ProgressEvent::new("target", ProgressStage::JobStarted, 0, ""))
                .unwrap();
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.job_id, "target");
    }
}
