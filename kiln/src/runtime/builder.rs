use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use super::process::BackgroundProcess;
use super::server::BackgroundJobServer;
use crate::cancellation::ServerTokens;
use crate::config::ServerOptions;
use crate::cron::{CronOccurrences, OccurrenceCalculator};
use crate::delayed::DelayedJobScheduler;
use crate::events::ServerEventBus;
use crate::filters::{AutomaticRetry, ElectStateFilter, FilterPipeline, ServerFilter};
use crate::heartbeat::ServerWatchdog;
use crate::identity::ServerId;
use crate::lease::LeaseTokenRegistry;
use crate::performer::{BackgroundJobPerformer, JobPerformer};
use crate::recurring::RecurringJobScheduler;
use crate::state_changer::StateChanger;
use crate::storage::JobStorage;
use crate::watcher::CancellationWatcher;
use crate::worker::Worker;

/// Builder for a [`BackgroundJobServer`] with explicit dependencies.
///
/// Storage and a performer are required; everything else has a default.
/// Elect-state filters start out as a single [`AutomaticRetry`].
///
/// # Example
///
/// ```ignore
/// use kiln::*;
///
/// let server = BackgroundJobServerBuilder::new(ServerOptions::default())
///     .with_storage(Arc::new(InMemoryStorage::default()))
///     .with_performer(Arc::new(MyPerformer))
///     .with_server_filter(Arc::new(LogEverything))
///     .build()?;
/// server.start();
/// ```
pub struct BackgroundJobServerBuilder {
    options: ServerOptions,
    storage: Option<Arc<dyn JobStorage>>,
    performer: Option<Arc<dyn JobPerformer>>,
    elect_filters: Vec<Arc<dyn ElectStateFilter>>,
    server_filters: Vec<Arc<dyn ServerFilter>>,
    processes: Vec<Arc<dyn BackgroundProcess>>,
    calculator: Option<Arc<dyn OccurrenceCalculator>>,
    events: Option<ServerEventBus>,
    tokens: Option<ServerTokens>,
    registry: Option<LeaseTokenRegistry>,
}

impl fmt::Debug for BackgroundJobServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundJobServerBuilder")
            .field("options", &self.options)
            .field("storage_set", &self.storage.is_some())
            .field("performer_set", &self.performer.is_some())
            .field("elect_filters", &self.elect_filters.len())
            .field("server_filters", &self.server_filters.len())
            .field("processes", &self.processes.len())
            .field("calculator_set", &self.calculator.is_some())
            .field("tokens_set", &self.tokens.is_some())
            .field("builder_type", &type_name::<Self>())
            .finish()
    }
}

impl Default for BackgroundJobServerBuilder {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl BackgroundJobServerBuilder {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            storage: None,
            performer: None,
            elect_filters: vec![Arc::new(AutomaticRetry::default())],
            server_filters: Vec::new(),
            processes: Vec::new(),
            calculator: None,
            events: None,
            tokens: None,
            registry: None,
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn JobStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_performer(mut self, performer: Arc<dyn JobPerformer>) -> Self {
        self.performer = Some(performer);
        self
    }

    /// Appends an elect-state filter after the ones already configured.
    pub fn with_elect_filter(mut self, filter: Arc<dyn ElectStateFilter>) -> Self {
        self.elect_filters.push(filter);
        self
    }

    /// Replaces every elect-state filter, the default [`AutomaticRetry`] included.
    pub fn with_elect_filters(mut self, filters: Vec<Arc<dyn ElectStateFilter>>) -> Self {
        self.elect_filters = filters;
        self
    }

    /// Failed jobs stay Failed instead of being retried.
    pub fn without_automatic_retry(mut self) -> Self {
        self.elect_filters.retain(|filter| filter.name() != AutomaticRetry::NAME);
        self
    }

    /// Appends a server filter; the first one added is the outermost.
    pub fn with_server_filter(mut self, filter: Arc<dyn ServerFilter>) -> Self {
        self.server_filters.push(filter);
        self
    }

    /// Adds a host process dispatched next to the built-in ones.
    pub fn with_process(mut self, process: Arc<dyn BackgroundProcess>) -> Self {
        self.processes.push(process);
        self
    }

    pub fn with_occurrence_calculator(mut self, calculator: Arc<dyn OccurrenceCalculator>) -> Self {
        self.calculator = Some(calculator);
        self
    }

    pub fn with_events(mut self, events: ServerEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Host tokens the server derives its own from. Defaults to a fresh
    /// hierarchy.
    pub fn with_tokens(mut self, tokens: ServerTokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_lease_registry(mut self, registry: LeaseTokenRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the options and wires every process.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or the performer is missing or the
    /// options are invalid.
    pub fn build(self) -> anyhow::Result<BackgroundJobServer> {
        self.options.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage dependency missing"))?;
        let performer = self
            .performer
            .ok_or_else(|| anyhow::anyhow!("performer dependency missing"))?;
        let options = self.options;
        let tokens = self.tokens.unwrap_or_default().derive();
        let events = self.events.unwrap_or_default();
        let registry = self.registry.unwrap_or_default();
        let calculator = self
            .calculator
            .unwrap_or_else(|| Arc::new(CronOccurrences::default()));

        let server_id = ServerId::generate(&options.server_name);
        let state_changer = StateChanger::new(self.elect_filters);
        let performer =
            BackgroundJobPerformer::new(performer, FilterPipeline::new(self.server_filters));

        let mut processes: Vec<Arc<dyn BackgroundProcess>> = vec![
            Arc::new(Worker::new(
                options.queues.clone(),
                options.worker_count,
                options.worker.clone(),
                state_changer.clone(),
                performer,
                registry.clone(),
            )),
            Arc::new(DelayedJobScheduler::new(
                options.delayed.clone(),
                state_changer.clone(),
            )),
            Arc::new(RecurringJobScheduler::with_calculator(
                options.recurring.clone(),
                state_changer.clone(),
                calculator,
            )),
            Arc::new(ServerWatchdog::new(
                options.server_check_interval(),
                options.server_timeout(),
            )),
            Arc::new(CancellationWatcher::new(
                registry.clone(),
                options.cancellation_check_interval(),
            )),
        ];
        processes.extend(self.processes);

        tracing::debug!(
            %server_id,
            processes = processes.len(),
            "background job server built"
        );

        Ok(BackgroundJobServer::new(
            server_id,
            options,
            tokens,
            storage,
            state_changer,
            events,
            processes,
            registry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::performer::PerformContext;
    use crate::storage::memory::InMemoryStorage;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl JobPerformer for Noop {
        async fn perform(&self, _ctx: &PerformContext) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
    }

    #[test]
    fn missing_dependencies_are_reported() {
        let error = BackgroundJobServerBuilder::default()
            .with_performer(Arc::new(Noop))
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("storage"));

        let error = BackgroundJobServerBuilder::default()
            .with_storage(Arc::new(InMemoryStorage::default()))
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("performer"));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let error = BackgroundJobServerBuilder::new(ServerOptions::default().with_queues(["Bad Queue"]))
            .with_storage(Arc::new(InMemoryStorage::default()))
            .with_performer(Arc::new(Noop))
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("Bad Queue"));
    }

    #[test]
    fn server_id_uses_configured_name() {
        let server = BackgroundJobServerBuilder::new(ServerOptions::default().with_server_name("Mailer"))
            .with_storage(Arc::new(InMemoryStorage::default()))
            .with_performer(Arc::new(Noop))
            .build()
            .unwrap();
        assert!(server.server_id().as_str().starts_with("mailer:"));
        assert!(!server.is_running());
    }

    #[test]
    fn automatic_retry_can_be_removed() {
        let builder = BackgroundJobServerBuilder::default().without_automatic_retry();
        assert!(builder.elect_filters.is_empty());
    }
}
