use async_trait::async_trait;
use std::sync::Arc;

use super::execution::ExecutionPolicy;
use crate::cancellation::{RestartSignal, ServerTokens};
use crate::error::Result;
use crate::events::{ServerEventBus, ServerEventPayload};
use crate::identity::{ExecutionId, ServerId};
use crate::storage::JobStorage;

/// A long-lived server component.
///
/// `execute` performs one unit of work; the execution harness calls it again
/// and again until `Stopping` fires, retrying failures with backoff.
#[async_trait]
pub trait BackgroundProcess: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &ProcessContext) -> Result<()>;

    /// Number of tasks the dispatcher runs for this process.
    fn concurrency(&self) -> usize {
        1
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::default()
    }
}

/// Everything a process needs from the server running it.
#[derive(Clone)]
pub struct ProcessContext {
    pub server_id: ServerId,
    /// Minted again for every call to `execute`.
    pub execution_id: ExecutionId,
    pub tokens: ServerTokens,
    pub storage: Arc<dyn JobStorage>,
    pub restart: RestartSignal,
    pub events: ServerEventBus,
}

impl ProcessContext {
    /// A standalone context whose restart signal cancels `tokens` directly.
    pub fn new(server_id: ServerId, storage: Arc<dyn JobStorage>, tokens: ServerTokens) -> Self {
        Self {
            server_id,
            execution_id: ExecutionId::new(),
            restart: RestartSignal::new(tokens.clone()),
            tokens,
            storage,
            events: ServerEventBus::default(),
        }
    }

    pub fn with_events(mut self, events: ServerEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn is_stopping(&self) -> bool {
        self.tokens.stopping().is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.tokens.stopped().is_cancelled()
    }

    pub fn with_execution_id(&self, execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            ..self.clone()
        }
    }

    pub fn publish(&self, payload: ServerEventPayload) {
        self.events.publish(&self.server_id, payload);
    }
}
