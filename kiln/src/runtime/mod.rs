/// Server builder wiring storage, performer, filters and processes.
pub mod builder;
/// Task pools running a process under the execution harness.
pub mod dispatcher;
/// Retry-with-backoff harness shared by every long-lived component.
pub mod execution;
/// The `BackgroundProcess` trait and the context handed to processes.
pub mod process;
/// The server orchestrator and its generation loop.
pub mod server;

pub use builder::BackgroundJobServerBuilder;
pub use dispatcher::Dispatcher;
pub use execution::{backoff_delay, ExecutionMode, ExecutionPolicy};
pub use process::{BackgroundProcess, ProcessContext};
pub use server::BackgroundJobServer;
