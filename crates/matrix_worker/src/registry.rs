//! Worker registration and lookup.
//!
//! A process may expose many Workers (one per `entity@version` slot). Each
//! is announced to the Gateway; failures land in a retry set serviced by a
//! background daemon until registration eventually succeeds. Lookup maps
//! only ever grow, and readers tolerate absence, so no global lock is
//! needed.

use dashmap::{DashMap, DashSet};
use matrix_protocol::{EventType, PayloadType, Worker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::IntranetClient;
use crate::executor::Executor;
use crate::load::LoadProbe;

/// Delay between retry passes over failed registrations.
const REGISTER_RETRY_GAP: Duration = Duration::from_secs(5);

/// A Worker slot plus the executors the application registered on it.
pub struct RegisteredWorker {
    pub record: Worker,
    pub custom_executors: HashMap<String, Arc<dyn Executor>>,
    pub task_executors: HashMap<String, Arc<dyn Executor>>,
}

impl RegisteredWorker {
    pub fn new(record: Worker) -> Self {
        Self {
            record,
            custom_executors: HashMap::new(),
            task_executors: HashMap::new(),
        }
    }

    pub fn with_custom_executor(
        mut self,
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.custom_executors.insert(name.into(), executor);
        self
    }

    pub fn with_task_executor(
        mut self,
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.task_executors.insert(name.into(), executor);
        self
    }
}

/// One entry of a heartbeat reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckWorkerReply {
    pub worker_id: String,
    pub exist: bool,
    pub load_rate: f64,
}

pub struct WorkerRegistry {
    client: Arc<IntranetClient>,
    gateway: String,
    load: Arc<LoadProbe>,
    ids: DashSet<String>,
    by_label: DashMap<String, Arc<RegisteredWorker>>,
    failed: DashMap<String, Arc<RegisteredWorker>>,
}

impl WorkerRegistry {
    pub fn new(client: Arc<IntranetClient>, gateway: impl Into<String>, load: Arc<LoadProbe>) -> Self {
        Self {
            client,
            gateway: gateway.into(),
            load,
            ids: DashSet::new(),
            by_label: DashMap::new(),
            failed: DashMap::new(),
        }
    }

    /// Announce a Worker to the Gateway.
    ///
    /// The stable id is computed up front and returned either way; a failed
    /// announcement parks the worker in the retry set.
    pub async fn register_worker(&self, mut worker: RegisteredWorker) -> String {
        worker.record.custom_executors = worker.custom_executors.keys().cloned().collect();
        worker.record.task_executors = worker.task_executors.keys().cloned().collect();
        worker.record.id = worker.record.compute_id();

        let id = worker.record.id.clone();
        let worker = Arc::new(worker);

        match self.send_register(&worker.record).await {
            Ok(()) => self.install(worker),
            Err(e) => {
                warn!(
                    "Worker {} registration failed, queued for retry: {}",
                    worker.record.entity_label(),
                    e
                );
                self.failed.insert(id.clone(), worker);
            }
        }
        id
    }

    fn install(&self, worker: Arc<RegisteredWorker>) {
        let label = worker.record.entity_label();
        info!("Worker registered: {} ({})", label, worker.record.id);
        self.ids.insert(worker.record.id.clone());
        self.by_label.insert(label, worker);
    }

    async fn send_register(&self, record: &Worker) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(record)?;
        let response = self
            .client
            .post(
                &self.gateway,
                EventType::WtgRegister.as_u16(),
                PayloadType::Json,
                &payload,
            )
            .await?;
        if response.status_code != 200 {
            anyhow::bail!("gateway answered {}", response.status_code);
        }
        Ok(())
    }

    pub fn has_worker(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Lookup by `project.context.entity@version`.
    pub fn worker_by_event(&self, entity_label: &str) -> Option<Arc<RegisteredWorker>> {
        self.by_label.get(entity_label).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of the registered Worker records.
    pub fn worker_records(&self) -> Vec<Worker> {
        self.by_label
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect()
    }

    /// Answer a Gateway heartbeat probe for a comma-joined id list.
    pub fn check_workers(&self, ids_csv: &str) -> Vec<CheckWorkerReply> {
        let load_rate = self.load.load_rate();
        ids_csv
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| CheckWorkerReply {
                worker_id: id.to_string(),
                exist: self.has_worker(id),
                load_rate,
            })
            .collect()
    }

    /// Retry failed registrations until shutdown; never gives up on one.
    pub fn start_retry_daemon(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REGISTER_RETRY_GAP);
            loop {
                tokio::select! {
                    _ = tick.tick() => registry.retry_failed().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn retry_failed(&self) {
        let pending: Vec<(String, Arc<RegisteredWorker>)> = self
            .failed
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (id, worker) in pending {
            match self.send_register(&worker.record).await {
                Ok(()) => {
                    self.failed.remove(&id);
                    self.install(worker);
                }
                Err(e) => {
                    warn!(
                        "Worker {} registration retry failed: {}",
                        worker.record.entity_label(),
                        e
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use matrix_protocol::{Envelope, SecretAlgorithm, WorkerMode};

    fn offline_registry() -> Arc<WorkerRegistry> {
        let client = Arc::new(IntranetClient::new(
            ClientConfig::default(),
            Envelope::new(SecretAlgorithm::None, ""),
        ));
        Arc::new(WorkerRegistry::new(
            client,
            "127.0.0.1:1",
            Arc::new(LoadProbe::new()),
        ))
    }

    fn sample_worker() -> RegisteredWorker {
        RegisteredWorker::new(Worker {
            server_id: "srv-1".into(),
            project: "demo".into(),
            version_label: "0.0.1".into(),
            context: "main".into(),
            entity: "user_info".into(),
            mode: WorkerMode::Command,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_failed_registration_parks_for_retry() {
        let registry = offline_registry();
        let id = registry.register_worker(sample_worker()).await;

        assert!(!id.is_empty());
        assert_eq!(registry.failed_count(), 1);
        // Not installed until the Gateway accepts it.
        assert!(!registry.has_worker(&id));
        assert!(registry
            .worker_by_event("demo.main.user_info@0.0.1")
            .is_none());
    }

    #[tokio::test]
    async fn test_check_workers_reports_absence() {
        let registry = offline_registry();
        let replies = registry.check_workers("abc, ,def");
        assert_eq!(replies.len(), 2);
        assert!(!replies[0].exist);
        assert_eq!(replies[0].worker_id, "abc");
    }

    #[tokio::test]
    async fn test_executor_names_exported_to_record() {
        struct Nop;
        #[async_trait::async_trait]
        impl Executor for Nop {
            async fn execute(
                &self,
                _ctx: Arc<crate::context::EventContext>,
            ) -> matrix_protocol::EventResponse {
                matrix_protocol::EventResponse::success()
            }
        }

        let registry = offline_registry();
        let worker = sample_worker()
            .with_custom_executor("audit", Arc::new(Nop))
            .with_task_executor("notify", Arc::new(Nop));
        registry.register_worker(worker).await;

        let parked: Vec<_> = registry
            .failed
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        assert_eq!(parked[0].record.custom_executors, vec!["audit".to_string()]);
        assert_eq!(parked[0].record.task_executors, vec!["notify".to_string()]);
    }
}
