//! Event Matrix worker runtime.
//!
//! Accepts validated business events over the binary intranet protocol or
//! the public HTTP facade, dispatches them to registered executors with
//! bounded-time semantics, runs background tasks with cubic-backoff
//! retries, and keeps control-plane state (worker registration, shared
//! configures, domain metadata) coherent with the Gateway.

pub mod auth;
pub mod buffer_pool;
pub mod client;
pub mod context;
pub mod dispatch;
pub mod domain;
pub mod env;
pub mod executor;
pub mod invoker;
pub mod load;
pub mod metrics;
pub mod public_server;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod shared_configure;
pub mod tasks;
pub mod validator;

pub use client::{ClientConfig, IntranetClient};
pub use context::{EventContext, Surface};
pub use dispatch::{DispatchReply, Dispatcher, Plugin, PluginRequest};
pub use executor::{builtin_executor, CustomFieldParser, Executor, Filter, FlowControl, Interceptor};
pub use invoker::Invoker;
pub use metrics::ServerMetrics;
pub use registry::{CheckWorkerReply, RegisteredWorker, WorkerRegistry};
pub use runtime::WorkerServer;
pub use tasks::{backoff_delay_ms, TaskCenter, TaskCenterPlugin};

#[derive(clap::Parser, Debug)]
#[command(name = "matrix-worker", about = "Event Matrix worker server")]
pub struct WorkerArgs {
    /// Path to a YAML or JSON worker config file
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Mirror the log file filter to stderr
    #[arg(long)]
    pub verbose: bool,
}
