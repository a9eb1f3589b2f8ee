//! Process-local job event bus.
//!
//! The manager publishes job lifecycle events to a broadcast channel;
//! subscribers may be in-process (a dashboard poller, tests) or bridged out
//! over SSE by an outer shell. Lagging subscribers lose old events rather
//! than blocking the publisher.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The set of jobs changed (enqueue, terminal transition).
    JobListChange,
    /// A job completed another page. `pages_done` is non-decreasing per job.
    JobProgress {
        job_id: String,
        pages_done: u64,
        pages_max: u64,
        url: String,
    },
    /// A job moved to a new status.
    JobStatus { job_id: String, status: String },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget publish; events without subscribers are dropped.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        bus.emit(JobEvent::JobListChange);
        bus.emit(JobEvent::JobProgress {
            job_id: "j1".into(),
            pages_done: 1,
            pages_max: 10,
            url: "https://x.test/a".into(),
        });

        assert!(matches!(receiver.recv().await, Ok(JobEvent::JobListChange)));
        match receiver.recv().await {
            Ok(JobEvent::JobProgress { pages_done, .. }) => assert_eq!(pages_done, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(JobEvent::JobListChange);
    }
}
