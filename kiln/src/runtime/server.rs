use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::dispatcher::{wait_all, Dispatcher};
use super::execution::{self, ExecutionPolicy};
use super::process::{BackgroundProcess, ProcessContext};
use crate::cancellation::{sleep_or_cancel, CancelLevel, RestartSignal, ServerTokens};
use crate::client::BackgroundJobClient;
use crate::config::ServerOptions;
use crate::error::Result;
use crate::events::{ServerEvent, ServerEventBus, ServerEventPayload};
use crate::heartbeat::ServerHeartbeat;
use crate::identity::{ExecutionId, ServerId};
use crate::lease::LeaseTokenRegistry;
use crate::state_changer::StateChanger;
use crate::storage::{JobStorage, ServerContext};
use crate::telemetry;

/// Runs one server generation per `execute` call.
///
/// A generation announces the server, dispatches every process on a freshly
/// derived token set and waits for it to be cancelled. A restart request
/// ends the generation without removing the server record, and the
/// execution harness then starts the next one.
///
/// The heartbeat is not part of a generation. It is spawned by the first
/// one on a set that only follows the server's `Shutdown` and keeps beating
/// through restarts until the final stop.
pub(crate) struct ServerProcess {
    options: ServerOptions,
    processes: Vec<Arc<dyn BackgroundProcess>>,
    registry: LeaseTokenRegistry,
    generation: AtomicU64,
    restart: RestartSignal,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

struct HeartbeatTask {
    dispatcher: Dispatcher,
    tokens: ServerTokens,
}

impl ServerProcess {
    pub(crate) fn new(
        options: ServerOptions,
        processes: Vec<Arc<dyn BackgroundProcess>>,
        registry: LeaseTokenRegistry,
    ) -> Self {
        Self {
            options,
            processes,
            registry,
            generation: AtomicU64::new(0),
            restart: RestartSignal::new(ServerTokens::new()),
            heartbeat: Mutex::new(None),
        }
    }

    /// Starts the heartbeat unless one is already running.
    fn ensure_heartbeat(&self, ctx: &ProcessContext) {
        let mut slot = self.heartbeat.lock();
        if slot
            .as_ref()
            .is_some_and(|task| !task.dispatcher.is_finished())
        {
            return;
        }
        let tokens = ctx.tokens.derive_shutdown_only();
        let dispatcher = Dispatcher::spawn(
            Arc::new(ServerHeartbeat::new(
                self.options.heartbeat_interval(),
                self.options.server_timeout(),
            )),
            ProcessContext {
                execution_id: ExecutionId::new(),
                tokens: tokens.clone(),
                restart: self.restart.clone(),
                ..ctx.clone()
            },
        );
        *slot = Some(HeartbeatTask { dispatcher, tokens });
    }

    /// Cancels the heartbeat and waits for it. Does nothing if it is not running.
    pub(crate) async fn stop_heartbeat(&self) {
        let Some(mut task) = self.heartbeat.lock().take() else {
            return;
        };
        task.tokens.cancel(CancelLevel::Shutdown);
        if !task.dispatcher.wait(self.options.last_chance_timeout()).await {
            task.dispatcher.dispose();
        }
    }

    fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|task| !task.dispatcher.is_finished())
    }

    fn server_context(&self) -> ServerContext {
        ServerContext {
            queues: self.options.queues.clone(),
            worker_count: self.options.worker_count,
        }
    }

    /// Escalates through the cancellation levels until every dispatcher has
    /// finished or the last grace period ran out.
    async fn stop_dispatchers(
        &self,
        ctx: &ProcessContext,
        tokens: &ServerTokens,
        dispatchers: &mut [Dispatcher],
    ) {
        let mut remaining = wait_all(dispatchers, self.options.stop_timeout()).await;
        if !remaining.is_empty() {
            tracing::debug!(components = ?remaining, "cancelling in-flight work");
            tokens.cancel(CancelLevel::Stopped);
            remaining = wait_all(dispatchers, self.options.shutdown_timeout()).await;
        }
        if !remaining.is_empty() {
            tracing::debug!(components = ?remaining, "shutting down");
            tokens.cancel(CancelLevel::Shutdown);
            remaining = wait_all(dispatchers, self.options.last_chance_timeout()).await;
        }
        tokens.cancel(CancelLevel::Shutdown);

        if !remaining.is_empty() {
            tracing::warn!(
                components = ?remaining,
                "components did not stop in time, aborting them"
            );
            ctx.publish(ServerEventPayload::NonGracefulStop {
                components: remaining,
            });
            for dispatcher in dispatchers.iter_mut() {
                dispatcher.dispose();
            }
        }
    }

    async fn remove_server(&self, ctx: &ProcessContext) {
        self.registry.unregister_server(&ctx.server_id);
        let removed = async {
            let connection = ctx.storage.connection().await?;
            connection.remove_server(&ctx.server_id).await
        }
        .await;
        match removed {
            Ok(()) => {
                tracing::info!("server removed");
                ctx.publish(ServerEventPayload::Removed);
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to remove server record, the watchdog will reap it")
            }
        }
    }
}

#[async_trait]
impl BackgroundProcess for ServerProcess {
    fn name(&self) -> &str {
        "BackgroundJobServer"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let tokens = ctx.tokens.derive();

        let connection = ctx.storage.connection().await?;
        connection
            .announce_server(&ctx.server_id, &self.server_context())
            .await?;
        drop(connection);
        // Requests raised while the record was missing are settled by the announce.
        let restart = self.restart.clone();
        restart.rearm(tokens.clone());
        self.registry.register_server(&ctx.server_id);
        tracing::info!(
            generation,
            queues = ?self.options.queues,
            workers = self.options.worker_count,
            "server announced"
        );
        ctx.publish(ServerEventPayload::Announced);

        let generation_ctx = ProcessContext {
            execution_id: ExecutionId::new(),
            tokens: tokens.clone(),
            restart: restart.clone(),
            ..ctx.clone()
        };

        self.ensure_heartbeat(ctx);

        let mut dispatchers: Vec<Dispatcher> = self
            .processes
            .iter()
            .cloned()
            .chain(ctx.storage.processes())
            .map(|process| Dispatcher::spawn(process, generation_ctx.clone()))
            .collect();
        tracing::info!(generation, components = dispatchers.len(), "server started");
        ctx.publish(ServerEventPayload::Started { generation });

        tokens.stopping().cancelled().await;

        let restarting = restart.is_requested() && !ctx.is_stopping();
        if restarting {
            let reason = restart.reason().unwrap_or_default();
            tracing::warn!(generation, reason = %reason, "restarting server");
            ctx.publish(ServerEventPayload::RestartRequested { reason });
        } else {
            tracing::info!(generation, "stopping server");
            ctx.publish(ServerEventPayload::StopRequested);
        }

        self.stop_dispatchers(&generation_ctx, &tokens, &mut dispatchers)
            .await;

        if restarting {
            sleep_or_cancel(ctx.tokens.stopping(), self.options.restart_delay()).await;
            if !ctx.is_stopping() {
                return Ok(());
            }
        }
        self.stop_heartbeat().await;
        self.remove_server(ctx).await;
        Ok(())
    }
}

/// A running job server.
///
/// Created by [`BackgroundJobServerBuilder`](super::BackgroundJobServerBuilder).
/// [`start`](Self::start) spawns the server onto the current tokio runtime;
/// [`stop`](Self::stop) walks it through the graceful shutdown sequence.
pub struct BackgroundJobServer {
    server_id: ServerId,
    options: ServerOptions,
    tokens: ServerTokens,
    storage: Arc<dyn JobStorage>,
    state_changer: StateChanger,
    events: ServerEventBus,
    process: Arc<ServerProcess>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackgroundJobServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobServer")
            .field("server_id", &self.server_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BackgroundJobServer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server_id: ServerId,
        options: ServerOptions,
        tokens: ServerTokens,
        storage: Arc<dyn JobStorage>,
        state_changer: StateChanger,
        events: ServerEventBus,
        processes: Vec<Arc<dyn BackgroundProcess>>,
        registry: LeaseTokenRegistry,
    ) -> Self {
        let process = Arc::new(ServerProcess::new(options.clone(), processes, registry));
        Self {
            server_id,
            options,
            tokens,
            storage,
            state_changer,
            events,
            process,
            task: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn events(&self) -> &ServerEventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// The server's own token set, derived from the host's.
    pub fn tokens(&self) -> &ServerTokens {
        &self.tokens
    }

    /// Generations started so far.
    pub fn generation(&self) -> u64 {
        self.process.generation.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat task is alive. It keeps running across restarts.
    pub fn is_heartbeat_running(&self) -> bool {
        self.process.heartbeat_running()
    }

    /// A client writing to the same storage with the same elect-state filters.
    pub fn client(&self) -> BackgroundJobClient {
        BackgroundJobClient::new(Arc::clone(&self.storage), self.state_changer.clone())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawns the server. Calling it on a running server does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let ctx = ProcessContext {
            server_id: self.server_id.clone(),
            execution_id: ExecutionId::new(),
            tokens: self.tokens.clone(),
            storage: Arc::clone(&self.storage),
            restart: RestartSignal::new(self.tokens.clone()),
            events: self.events.clone(),
        };
        let server = Arc::clone(&self.process);
        let process: Arc<dyn BackgroundProcess> = server.clone();
        let span = telemetry::server_span(&self.server_id);
        *task = Some(tokio::spawn(
            async move {
                if let Err(error) = execution::run(process, ctx, ExecutionPolicy::default()).await {
                    tracing::error!(error = %error, fatal = true, "server stopped with an error");
                }
                // A generation that failed before its final stop leaves the heartbeat behind.
                server.stop_heartbeat().await;
            }
            .instrument(span),
        ));
    }

    /// Requests a graceful stop and waits for it to complete.
    ///
    /// Returns `false` if the server task had to be aborted because it
    /// outlived every configured grace period.
    pub async fn stop(&self) -> bool {
        self.tokens.cancel(CancelLevel::Stopping);
        self.wait(self.stop_budget()).await
    }

    /// Waits for the server task to end on its own.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let Some(mut task) = self.task.lock().take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, fatal = true, "server task failed");
                true
            }
            Err(_) => {
                tracing::warn!("server did not stop in time, aborting it");
                task.abort();
                false
            }
        }
    }

    fn stop_budget(&self) -> Duration {
        self.options.stop_timeout()
            + self.options.shutdown_timeout()
            + self.options.last_chance_timeout() * 2
            + Duration::from_secs(1)
    }
}

impl Drop for BackgroundJobServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            self.tokens.cancel(CancelLevel::Shutdown);
            task.abort();
        }
    }
}
