//! Background task execution with cubic-backoff retries.
//!
//! Tasks wrap deferred event calls. The durable table is the source of
//! truth; an in-memory slot map bounds how many run concurrently in this
//! process (advisory: a slight overshoot under race is fine). The
//! scheduler pulls due PENDING tasks into slots; the retry loop re-queues
//! orphaned IN_PROGRESS and TIMEOUT rows once their backoff has elapsed.
//! This is a single-node scheduler: running several workers against one
//! task table would double-execute.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use matrix_db::TaskStore;
use matrix_protocol::defaults::SPLIT;
use matrix_protocol::{
    now_millis, Endpoint, EventResponse, EventType, PayloadType, ResponseCode, Task, TaskStatus,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::IntranetClient;

const SCHEDULER_TICK: Duration = Duration::from_secs(3);
const RETRY_TICK: Duration = Duration::from_secs(10);
/// Backoff base: 5 s times the cube of the retry count.
const RETRY_BASE_MS: i64 = 5_000;
/// Backoff ceiling: one hour.
const RETRY_CAP_MS: i64 = 3_600_000;
/// Page size when walking the task table.
const TASK_PAGE: i64 = 50;

/// Cubic retry backoff, saturating at one hour.
pub fn backoff_delay_ms(retries: i64) -> i64 {
    if retries <= 0 {
        return 0;
    }
    // 5000 * 9^3 already exceeds the cap.
    if retries >= 9 {
        return RETRY_CAP_MS;
    }
    (RETRY_BASE_MS * retries * retries * retries).min(RETRY_CAP_MS)
}

pub struct TaskCenter {
    store: TaskStore,
    client: Arc<IntranetClient>,
    gateway: String,
    server_id: String,
    in_process: DashMap<String, ()>,
    max_in_process: usize,
}

impl TaskCenter {
    pub fn new(
        store: TaskStore,
        client: Arc<IntranetClient>,
        gateway: impl Into<String>,
        server_id: impl Into<String>,
        max_in_process: usize,
    ) -> Self {
        Self {
            store,
            client,
            gateway: gateway.into(),
            server_id: server_id.into(),
            in_process: DashMap::new(),
            max_in_process: max_in_process.max(1),
        }
    }

    pub fn in_process_count(&self) -> usize {
        self.in_process.len()
    }

    fn slot_available(&self) -> bool {
        self.in_process.len() < self.max_in_process
    }

    /// Enqueue a task; immediately runnable tasks grab a slot right away,
    /// everything else stays PENDING for the scheduler.
    pub async fn add_task(self: &Arc<Self>, task: Task) -> Result<TaskStatus> {
        self.store
            .upsert(&task)
            .await
            .context("failed to persist task")?;

        if task.execute_at <= now_millis() && self.slot_available() {
            if self.store.mark_in_progress(&task.id).await? {
                self.start(task);
                return Ok(TaskStatus::InProgress);
            }
        }
        Ok(TaskStatus::Pending)
    }

    fn start(self: &Arc<Self>, task: Task) {
        self.in_process.insert(task.id.clone(), ());
        let center = Arc::clone(self);
        tokio::spawn(async move {
            center.execute(task).await;
        });
    }

    async fn execute(self: Arc<Self>, task: Task) {
        debug!("Executing task {} ({})", task.id, task.event_label);
        match self.execute_remote(&task).await {
            Ok((status, exec_server)) => {
                if let Err(e) = self.finish_task(&task.id, status, &exec_server).await {
                    warn!("Failed to finish task {}: {}", task.id, e);
                }
            }
            Err(e) => {
                // Row stays IN_PROGRESS; the retry loop re-queues it after
                // its backoff.
                warn!("Task {} attempt failed: {}", task.id, e);
                self.in_process.remove(&task.id);
            }
        }
    }

    /// Resolve the owning worker through the Gateway and replay the event.
    /// The reply payload is `STATUS|server_id`.
    async fn execute_remote(&self, task: &Task) -> Result<(TaskStatus, String)> {
        let response = self
            .client
            .post(
                &self.gateway,
                EventType::WtgGetEndpointByEvent.as_u16(),
                PayloadType::Text,
                task.event_label.as_bytes(),
            )
            .await
            .context("endpoint lookup failed")?;
        if response.status_code != 200 {
            bail!("endpoint lookup answered {}", response.status_code);
        }

        let endpoint: Endpoint =
            serde_json::from_slice(&response.payload).context("unparsable endpoint")?;
        if endpoint.disabled {
            bail!("endpoint {} is disabled", endpoint.server_id);
        }

        let response = self
            .client
            .post(
                &endpoint.intranet_addr(),
                EventType::WtwEventCall.as_u16(),
                PayloadType::Json,
                task.event.as_bytes(),
            )
            .await
            .context("task event call failed")?;

        let text = String::from_utf8_lossy(&response.payload);
        let (status, exec_server) = text
            .split_once(SPLIT)
            .with_context(|| format!("malformed task reply: {text}"))?;
        let status = TaskStatus::from_str(status.trim())
            .map_err(|e| anyhow::anyhow!("malformed task status: {e}"))?;
        Ok((status, exec_server.trim().to_string()))
    }

    /// Release the slot and persist the outcome.
    ///
    /// Finishing a task that holds no slot is an error; it protects
    /// against double-finish.
    pub async fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        exec_server: &str,
    ) -> Result<()> {
        if self.in_process.remove(id).is_none() {
            bail!("task {id} is not in process");
        }
        self.store.finish(id, status, exec_server).await?;
        if status.is_terminal() {
            info!("Task {} finished as {}", id, status);
        }
        Ok(())
    }

    /// One scheduler pass: pull due PENDING tasks into free slots.
    pub async fn schedule_once(self: &Arc<Self>) {
        loop {
            if !self.slot_available() {
                return;
            }
            let due = match self.store.fetch_due_pending(now_millis(), TASK_PAGE).await {
                Ok(due) => due,
                Err(e) => {
                    warn!("Scheduler page failed: {}", e);
                    return;
                }
            };
            if due.is_empty() {
                return;
            }

            let mut claimed = 0;
            let page_len = due.len();
            for task in due {
                if !self.slot_available() {
                    return;
                }
                if self.in_process.contains_key(&task.id) {
                    continue;
                }
                match self.store.mark_in_progress(&task.id).await {
                    Ok(true) => {
                        claimed += 1;
                        self.start(task);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to claim task {}: {}", task.id, e),
                }
            }

            // A short or unclaimable page means there is nothing left due.
            if claimed == 0 || page_len < TASK_PAGE as usize {
                return;
            }
        }
    }

    /// One retry pass: re-queue orphaned IN_PROGRESS/TIMEOUT rows whose
    /// backoff has elapsed. Tasks holding a slot are never touched.
    pub async fn retry_once(&self) {
        let candidates = match self.store.fetch_retryable(TASK_PAGE).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Retry page failed: {}", e);
                return;
            }
        };

        let now = now_millis();
        for task in candidates {
            if self.in_process.contains_key(&task.id) {
                continue;
            }
            let delay = backoff_delay_ms(task.retries);
            if now < task.execute_at + delay {
                continue;
            }
            if let Err(e) = self.store.reschedule(&task.id, now + delay).await {
                warn!("Failed to reschedule task {}: {}", task.id, e);
            } else {
                debug!("Task {} re-queued with {} ms backoff", task.id, delay);
            }
        }
    }

    /// Spawn the scheduler and retry loops; they run until shutdown.
    pub fn start_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let center = Arc::clone(self);
        let mut scheduler_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => center.schedule_once().await,
                    _ = scheduler_shutdown.changed() => break,
                }
            }
        });

        let center = Arc::clone(self);
        let mut retry_shutdown = shutdown;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETRY_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => center.retry_once().await,
                    _ = retry_shutdown.changed() => break,
                }
            }
        });
    }
}

/// Intranet submission surface for tasks.
///
/// Applications register this plugin on an event-type code of their
/// choosing; peers then enqueue tasks by posting the wrapped event to that
/// code. The reply code tells the submitter whether the task started
/// immediately or was parked PENDING.
pub struct TaskCenterPlugin {
    code: u16,
    center: Arc<TaskCenter>,
    domain: Arc<crate::domain::DomainCache>,
}

impl TaskCenterPlugin {
    pub fn new(code: u16, center: Arc<TaskCenter>, domain: Arc<crate::domain::DomainCache>) -> Self {
        Self {
            code,
            center,
            domain,
        }
    }
}

#[async_trait::async_trait]
impl crate::dispatch::Plugin for TaskCenterPlugin {
    fn event_types(&self) -> Vec<u16> {
        vec![self.code]
    }

    async fn handle(&self, request: crate::dispatch::PluginRequest) -> EventResponse {
        let Ok(event) = serde_json::from_slice::<matrix_protocol::Event>(&request.payload) else {
            return EventResponse::error(ResponseCode::FailToProcess, "malformed task event");
        };

        let delay = self
            .domain
            .find_entity_event(&event)
            .await
            .map(|entity_event| entity_event.delay)
            .unwrap_or(0);

        let task = match Task::from_event(&event, delay) {
            Ok(task) => task,
            Err(e) => return EventResponse::error(ResponseCode::FailToProcess, e.to_string()),
        };
        let task_id = task.id.clone();

        match self.center.add_task(task).await {
            Ok(TaskStatus::InProgress) => {
                let mut response =
                    EventResponse::new(ResponseCode::TaskInProgress, "task started");
                response.list = vec![serde_json::json!({ "taskId": task_id })];
                response
            }
            Ok(_) => {
                let mut response = EventResponse::new(ResponseCode::TaskPending, "task queued");
                response.list = vec![serde_json::json!({ "taskId": task_id })];
                response
            }
            Err(e) => EventResponse::error(ResponseCode::FailToProcess, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use matrix_protocol::{Envelope, Event, SecretAlgorithm};

    async fn offline_center(max_in_process: usize) -> Arc<TaskCenter> {
        let pool = matrix_db::open_in_memory().await.unwrap();
        let client = Arc::new(IntranetClient::new(
            ClientConfig::default(),
            Envelope::new(SecretAlgorithm::None, ""),
        ));
        Arc::new(TaskCenter::new(
            TaskStore::new(pool),
            client,
            "127.0.0.1:1",
            "srv-test",
            max_in_process,
        ))
    }

    fn sample_task(id: &str, delay_secs: i64) -> Task {
        let event = Event {
            id: format!("evt-{id}"),
            project: "demo".into(),
            version: "0.0.1".into(),
            context: "main".into(),
            entity: "user_info".into(),
            event: "notify".into(),
            ..Default::default()
        };
        let mut task = Task::from_event(&event, delay_secs).unwrap();
        task.id = id.to_string();
        task
    }

    #[test]
    fn test_backoff_series() {
        assert_eq!(backoff_delay_ms(0), 0);
        assert_eq!(backoff_delay_ms(1), 5_000);
        assert_eq!(backoff_delay_ms(2), 40_000);
        assert_eq!(backoff_delay_ms(3), 135_000);
        assert_eq!(backoff_delay_ms(8), 2_560_000);
        // Saturation at one hour from the ninth retry on.
        assert_eq!(backoff_delay_ms(9), RETRY_CAP_MS);
        assert_eq!(backoff_delay_ms(1_000), RETRY_CAP_MS);
    }

    #[tokio::test]
    async fn test_delayed_task_stays_pending() {
        let center = offline_center(4).await;
        let status = center.add_task(sample_task("t1", 3_600)).await.unwrap();
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(center.in_process_count(), 0);
    }

    #[tokio::test]
    async fn test_immediate_task_takes_slot() {
        let center = offline_center(4).await;
        let status = center.add_task(sample_task("t1", 0)).await.unwrap();
        assert_eq!(status, TaskStatus::InProgress);
        // The spawned attempt fails against the offline gateway and frees
        // the slot; the row remains IN_PROGRESS for the retry loop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(center.in_process_count(), 0);
        let task = center.store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_slot_cap_respected() {
        let center = offline_center(1).await;
        // Occupy the only slot without an execution attempt.
        center.in_process.insert("held".to_string(), ());

        let status = center.add_task(sample_task("t2", 0)).await.unwrap();
        assert_eq!(status, TaskStatus::Pending);

        center.schedule_once().await;
        let task = center.store.get("t2").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_requeues_orphans_after_backoff() {
        let center = offline_center(4).await;
        let mut task = sample_task("t1", 0);
        task.execute_at = now_millis() - 60_000;
        center.store.upsert(&task).await.unwrap();
        center.store.mark_in_progress("t1").await.unwrap();

        // retries = 0: immediately eligible.
        center.retry_once().await;
        let task = center.store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);

        // Back in progress with one retry: 5 s backoff not yet elapsed.
        center.store.mark_in_progress("t1").await.unwrap();
        center.retry_once().await;
        let unchanged = center.store.get("t1").await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_in_slot_task_never_rescheduled() {
        let center = offline_center(4).await;
        let mut task = sample_task("t1", 0);
        task.execute_at = now_millis() - 60_000;
        center.store.upsert(&task).await.unwrap();
        center.store.mark_in_progress("t1").await.unwrap();
        center.in_process.insert("t1".to_string(), ());

        center.retry_once().await;
        let task = center.store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.retries, 0);
    }

    #[tokio::test]
    async fn test_double_finish_is_error() {
        let center = offline_center(4).await;
        let task = sample_task("t1", 0);
        center.store.upsert(&task).await.unwrap();
        center.in_process.insert("t1".to_string(), ());

        center
            .finish_task("t1", TaskStatus::Success, "srv-9")
            .await
            .unwrap();
        let again = center.finish_task("t1", TaskStatus::Success, "srv-9").await;
        assert!(again.is_err());
    }
}
