use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::identity::ServerId;
use crate::job::JobId;

/// Lifecycle notifications emitted by a running server.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ServerEventPayload {
    /// The server record was written to storage.
    Announced,
    /// A generation's dispatchers are running.
    Started { generation: u64 },
    /// A component asked for the current generation to be rebuilt.
    RestartRequested { reason: String },
    /// The host asked the server to stop.
    StopRequested,
    /// Components still running when the last grace period ran out.
    NonGracefulStop { components: Vec<String> },
    /// The server record was deleted on a final stop.
    Removed,
    /// A worker committed a terminal state for a job.
    JobSettled { job_id: JobId, state: String },
    /// A component task panicked and ended. The rest of the server keeps running.
    ComponentPanicked { component: String, message: String },
}

#[derive(Clone, Debug)]
pub struct ServerEvent {
    pub server_id: ServerId,
    pub timestamp: DateTime<Utc>,
    pub payload: ServerEventPayload,
}

/// In-process broadcast of [`ServerEvent`]s.
///
/// Publishing never blocks and never fails; events sent with no subscriber
/// are dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct ServerEventBus {
    sender: broadcast::Sender<ServerEvent>,
    capacity: usize,
}

impl std::fmt::Debug for ServerEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for ServerEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ServerEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn publish(&self, server_id: &ServerId, payload: ServerEventPayload) {
        let event = ServerEvent {
            server_id: server_id.clone(),
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = ServerEventBus::new(8);
        let mut rx = bus.subscribe();
        let server = ServerId::from("node:1:x");
        bus.publish(&server, ServerEventPayload::Started { generation: 1 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server_id, server);
        assert_eq!(event.payload, ServerEventPayload::Started { generation: 1 });
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = ServerEventBus::default();
        bus.publish(&ServerId::from("n"), ServerEventPayload::Removed);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
