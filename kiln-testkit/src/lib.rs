//! Test fixtures for kiln.
//!
//! - [`TestJob`] describes jobs as [`InvocationData`](kiln::InvocationData)
//!   that [`MockPerformer`] knows how to interpret.
//! - [`MockPerformer`] records every job it performs and follows a scripted
//!   [`Behavior`].
//! - [`RecordingFilter`] logs every filter hook it sees.
//! - [`FlakyStorage`] wraps [`InMemoryStorage`] and fails selected calls.

mod filter;
mod flaky;
mod job;
mod mock;

pub use filter::{FilterCall, RecordingFilter};
pub use flaky::{FlakyConnection, FlakyStorage};
pub use job::{enqueue, schedule, TestJob};
pub use mock::{Behavior, MockPerformer, PerformRecord};

use kiln::{
    BackgroundJobClient, InMemoryStorage, ProcessContext, ServerId, ServerTokens, StateChanger,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A client with no elect-state filters.
pub fn client(storage: &InMemoryStorage) -> BackgroundJobClient {
    BackgroundJobClient::new(Arc::new(storage.clone()), StateChanger::new(Vec::new()))
}

/// Context for driving a single process by hand.
pub fn process_context(storage: &InMemoryStorage) -> ProcessContext {
    ProcessContext::new(
        ServerId::from("test-server"),
        Arc::new(storage.clone()),
        ServerTokens::new(),
    )
}

/// Polls `condition` every 10ms until it holds or `timeout` runs out.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
