use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::execution;
use super::process::{BackgroundProcess, ProcessContext};
use crate::events::ServerEventPayload;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A pool of tasks running one [`BackgroundProcess`] under the execution harness.
pub struct Dispatcher {
    name: String,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn spawn(process: Arc<dyn BackgroundProcess>, ctx: ProcessContext) -> Self {
        let name = process.name().to_string();
        let count = process.concurrency().max(1);
        let policy = process.policy();

        let tasks = (0..count)
            .map(|index| {
                let span = tracing::info_span!(
                    "kiln.process",
                    process = %name,
                    index,
                    server_id = %ctx.server_id,
                );
                let process = Arc::clone(&process);
                let ctx = ctx.clone();
                let policy = policy.clone();
                let name = name.clone();
                tokio::spawn(
                    async move {
                        let run = execution::run(process, ctx.clone(), policy);
                        match AssertUnwindSafe(run).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => {
                                tracing::error!(process = %name, error = %error, "process stopped with an error");
                            }
                            Err(payload) => {
                                let message = panic_message(payload.as_ref());
                                tracing::error!(
                                    process = %name,
                                    panic = %message,
                                    fatal = true,
                                    "process task panicked"
                                );
                                ctx.publish(ServerEventPayload::ComponentPanicked {
                                    component: name,
                                    message,
                                });
                            }
                        }
                    }
                    .instrument(span),
                )
            })
            .collect();

        tracing::debug!(process = %name, tasks = count, "dispatcher started");
        Self { name, tasks }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Waits for every task to end. Returns `false` if `timeout` elapsed first.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(handle) = self.tasks.last_mut() {
            match tokio::time::timeout_at(deadline, handle).await {
                // Panics are caught and reported inside the task; only aborts remain.
                Ok(_) => {}
                Err(_) => return false,
            }
            self.tasks.pop();
        }
        true
    }

    /// Aborts whatever is still running.
    pub fn dispose(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Waits for all dispatchers within one shared `timeout`.
///
/// Returns the names of dispatchers that are still running.
pub async fn wait_all(dispatchers: &mut [Dispatcher], timeout: Duration) -> Vec<String> {
    let waits = dispatchers.iter_mut().map(|d| d.wait(timeout));
    let finished = futures::future::join_all(waits).await;
    dispatchers
        .iter()
        .zip(finished)
        .filter(|(_, done)| !done)
        .map(|(d, _)| d.name().to_string())
        .collect()
}
