//! Worker server assembly.
//!
//! Wires the client pool, persistence, caches, registry, task loops and
//! both listeners together, and owns the shutdown signal they all watch.

use anyhow::{Context, Result};
use matrix_db::{EventLogStore, RecordStore, RuntimeLogStore, TaskStore};
use matrix_protocol::{Envelope, Task, TaskStatus, WorkerServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::auth::AuthResolver;
use crate::client::{ClientConfig, IntranetClient};
use crate::dispatch::{Dispatcher, Plugin, RuleUpdateHandler};
use crate::domain::DomainCache;
use crate::executor::{Filter, Interceptor};
use crate::invoker::Invoker;
use crate::load::LoadProbe;
use crate::metrics::ServerMetrics;
use crate::public_server::{self, PublicState};
use crate::registry::{RegisteredWorker, WorkerRegistry};
use crate::server::IntranetServer;
use crate::shared_configure::{ConfigureChangeHandler, SharedConfigureStore};
use crate::tasks::TaskCenter;
use crate::validator::CustomParserRegistry;

/// Entry cap of the user-code lookup cache.
const UCODE_CACHE_CAPACITY: u64 = 100_000;

/// A running worker process: both listeners, the control-plane state and
/// the background loops.
pub struct WorkerServer {
    pub config: WorkerServerConfig,
    pub client: Arc<IntranetClient>,
    pub task_store: TaskStore,
    pub records: RecordStore,
    pub registry: Arc<WorkerRegistry>,
    pub domain: Arc<DomainCache>,
    pub shared: Arc<SharedConfigureStore>,
    pub tasks: Arc<TaskCenter>,
    pub invoker: Arc<Invoker>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<ServerMetrics>,
    pub load: Arc<LoadProbe>,
    pub custom_parsers: Arc<CustomParserRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerServer {
    /// Boot the worker: open storage, bind both listeners, start the
    /// janitor, registration daemon and task loops.
    pub async fn start(mut config: WorkerServerConfig) -> Result<Arc<Self>> {
        config.apply_defaults();

        let envelope = Envelope::new(config.secret_algorithm(), &config.intranet_secret);
        let client = Arc::new(IntranetClient::new(
            ClientConfig {
                max_idle_per_host: config.intranet_client_max_idle_conns_per_host,
                connection_expired: Duration::from_secs(config.intranet_client_connection_expired),
                write_timeout: Duration::from_secs(config.intranet_client_write_timeout),
                compress: config.intranet_compress,
                source_ip: config.intranet_host.clone(),
            },
            envelope.clone(),
        ));

        let db = matrix_db::open(&config.database_path)
            .await
            .context("failed to open worker database")?;
        let task_store = TaskStore::new(db.clone());
        let records = RecordStore::new(db.clone());
        let event_log = EventLogStore::new(db.clone());
        let runtime_log = RuntimeLogStore::new(db);

        let metrics = Arc::new(ServerMetrics::new());
        let load = Arc::new(LoadProbe::new());
        let custom_parsers = Arc::new(CustomParserRegistry::new());

        let gateway = config.gateway_intranet_endpoint.clone();
        let domain = Arc::new(DomainCache::new(
            Arc::clone(&client),
            &gateway,
            config.domain_cache_max_men,
            Duration::from_secs(config.domain_cache_ttl),
        ));
        let auth = Arc::new(AuthResolver::new(
            Arc::clone(&client),
            &gateway,
            UCODE_CACHE_CAPACITY,
            Duration::from_secs(config.default_cache_ttl),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&client),
            &gateway,
            Arc::clone(&load),
        ));
        let shared = Arc::new(SharedConfigureStore::new(Arc::clone(&client), &gateway));
        let tasks = Arc::new(TaskCenter::new(
            task_store.clone(),
            Arc::clone(&client),
            &gateway,
            &config.server_id,
            config.max_in_process_task,
        ));
        let invoker = Arc::new(Invoker::new(
            Arc::clone(&domain),
            Arc::clone(&custom_parsers),
            event_log,
            runtime_log,
            Arc::clone(&metrics),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            Arc::clone(&domain),
            Arc::clone(&registry),
            Arc::clone(&invoker),
            Arc::clone(&shared),
            records.clone(),
            Arc::clone(&load),
            auth,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        client.start_janitor(shutdown_rx.clone());
        registry.start_retry_daemon(shutdown_rx.clone());
        tasks.start_loops(shutdown_rx.clone());

        let intranet_listener = TcpListener::bind(config.intranet_addr())
            .await
            .with_context(|| format!("failed to bind intranet {}", config.intranet_addr()))?;
        let intranet = Arc::new(IntranetServer::new(
            Arc::clone(&dispatcher),
            envelope,
            Arc::clone(&metrics),
            config.intranet_compress,
        ));
        tokio::spawn(intranet.serve(intranet_listener, shutdown_rx.clone()));

        let public_listener = TcpListener::bind(config.public_addr())
            .await
            .with_context(|| format!("failed to bind public {}", config.public_addr()))?;
        let state = PublicState::new(
            Arc::clone(&dispatcher),
            config.work_mode.is_development(),
        );
        tokio::spawn(public_server::serve(public_listener, state, shutdown_rx));

        info!("Worker server {} started", config.server_id);

        Ok(Arc::new(Self {
            config,
            client,
            task_store,
            records,
            registry,
            domain,
            shared,
            tasks,
            invoker,
            dispatcher,
            metrics,
            load,
            custom_parsers,
            shutdown_tx,
        }))
    }

    /// Register a Worker slot: warm its backing configure, announce it to
    /// the Gateway and report the configure dependency.
    pub async fn register_worker(&self, worker: RegisteredWorker) -> String {
        let cfg_key = worker.record.cfg_key.clone();
        if !cfg_key.is_empty() {
            let _ = self.shared.shared_configure(&cfg_key).await;
        }
        let id = self.registry.register_worker(worker).await;
        if !cfg_key.is_empty() {
            self.shared.report_config_used_by(&cfg_key, &id);
        }
        id
    }

    /// Enqueue a background task.
    pub async fn add_task(&self, task: Task) -> Result<TaskStatus> {
        self.tasks.add_task(task).await
    }

    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.dispatcher.register_plugin(plugin)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.invoker.add_interceptor(interceptor);
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.invoker.add_filter(filter);
    }

    pub fn set_rule_update_handler(&self, handler: RuleUpdateHandler) {
        self.dispatcher.set_rule_update_handler(handler);
    }

    pub fn set_configure_change_handler(&self, handler: ConfigureChangeHandler) {
        self.shared.set_change_handler(handler);
    }

    /// App-level shedding probe.
    pub fn memory_runout(&self, threshold_percent: f64) -> bool {
        self.load.memory_runout(threshold_percent)
    }

    /// Flip the shutdown signal every background loop watches.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Block until ctrl-c, then shut everything down.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("Shutdown requested");
        self.shutdown();
        Ok(())
    }
}
