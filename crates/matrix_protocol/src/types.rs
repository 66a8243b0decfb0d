//! Domain model shared across the framework.
//!
//! The Gateway owns the canonical EntityEvent/EntityAttribute/SharedConfigure
//! records; workers cache them with a TTL. JSON field names follow the wire
//! convention (camelCase).

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::now_millis;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Enums
// ============================================================================

/// How an entity event is executed on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorType {
    #[default]
    Builtin,
    Custom,
    Task,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::Builtin => "BUILTIN",
            ExecutorType::Custom => "CUSTOM",
            ExecutorType::Task => "TASK",
        }
    }
}

/// Authentication requirement of an entity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    #[default]
    None,
    UserAuth,
    /// Only reachable over the intranet wire; the public facade rejects it.
    InternalAuth,
}

/// Declared type of an entity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Id,
    Ref,
    #[default]
    String,
    Text,
    Int8,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Datetime,
    Constant,
    Uid,
    Url,
    Email,
    Phone,
    Custom,
}

impl FieldType {
    /// Whether values coerce to a string representation.
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            FieldType::Id
                | FieldType::Ref
                | FieldType::String
                | FieldType::Text
                | FieldType::Constant
                | FieldType::Uid
                | FieldType::Url
                | FieldType::Email
                | FieldType::Phone
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::Int8 | FieldType::Int32 | FieldType::Int64 | FieldType::Datetime
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldType::Float32 | FieldType::Float64)
    }
}

/// Worker slot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMode {
    #[default]
    Command,
    Query,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Command => "COMMAND",
            WorkerMode::Query => "QUERY",
        }
    }
}

/// Background task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }

    /// Terminal tasks are never re-scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            "TIMEOUT" => Ok(TaskStatus::Timeout),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

/// Role of a registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    Gateway,
    #[default]
    Worker,
}

// ============================================================================
// Event
// ============================================================================

/// A signed, versioned business message — the inbound unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    pub id: String,
    pub project: String,
    pub version: String,
    pub context: String,
    pub entity: String,
    pub event: String,
    pub source: String,
    /// Raw JSON object of event parameters.
    pub params: String,
    pub access_token: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub sign: String,
}

impl Event {
    /// Unique event label: `project.context.entity->event@version`.
    pub fn unique_label(&self) -> String {
        format!(
            "{}.{}.{}->{}@{}",
            self.project, self.context, self.entity, self.event, self.version
        )
    }

    /// Entity label used for worker lookup: `project.context.entity@version`.
    pub fn entity_label(&self) -> String {
        format!(
            "{}.{}.{}@{}",
            self.project, self.context, self.entity, self.version
        )
    }

    /// Deterministic digest over every field but `sign`, keyed with the
    /// pre-shared intranet secret (HMAC-SHA256, lowercase hex).
    pub fn compute_sign(&self, secret: &str) -> String {
        let material = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.project,
            self.version,
            self.context,
            self.entity,
            self.event,
            self.source,
            self.params,
            self.access_token,
            self.created_at
        );
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(material.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Stamp `sign` (and `created_at` when unset) before sending.
    pub fn sign_with(&mut self, secret: &str) {
        if self.created_at == 0 {
            self.created_at = now_millis();
        }
        self.sign = self.compute_sign(secret);
    }

    /// Constant-length comparison is not required here: the digest is a
    /// request credential, not a password hash.
    pub fn verify_sign(&self, secret: &str) -> bool {
        !self.sign.is_empty() && self.sign == self.compute_sign(secret)
    }
}

// ============================================================================
// Gateway-owned metadata
// ============================================================================

/// Schema of an event as registered with the Gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityEvent {
    pub id: String,
    pub entity_id: String,
    pub code: String,
    pub executor_type: ExecutorType,
    /// Executor name; BUILTIN names select a stock handler.
    pub executor: String,
    /// Seconds a TASK is deferred before first execution.
    pub delay: i64,
    /// Executor deadline in seconds; 0 selects the per-type default.
    pub timeout: i64,
    /// JSON array of [`EventParam`] entries.
    pub params: String,
    pub mode: WorkerMode,
    pub logable: bool,
    pub auth_type: AuthType,
}

impl EntityEvent {
    /// Effective deadline: explicit timeout, else 3 s for executors and
    /// 10 s for tasks.
    pub fn timeout_secs(&self) -> u64 {
        if self.timeout > 0 {
            return self.timeout as u64;
        }
        match self.executor_type {
            ExecutorType::Task => 10,
            _ => 3,
        }
    }

    /// Parse the declared parameter schema. Absent or malformed schemas
    /// validate nothing.
    pub fn param_schema(&self) -> Vec<EventParam> {
        if self.params.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.params).unwrap_or_default()
    }
}

/// One declared parameter of an entity event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EventParam {
    /// Attribute code the parameter binds to.
    pub code: String,
    pub required: bool,
    /// Validation rule, e.g. `any`, `in:a,b`, `range:1,10`, `length:3,20`.
    pub range: String,
}

/// Attribute metadata of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityAttribute {
    pub code: String,
    pub field_type: FieldType,
    pub value_source: String,
    pub default_value: String,
    pub unique: bool,
    pub indexed: bool,
    /// Secrecy attributes are stripped from outbound responses.
    pub is_secrecy: bool,
}

/// One constant of a project dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Constant {
    pub dict: String,
    pub code: String,
    pub value: String,
}

// ============================================================================
// Worker
// ============================================================================

/// A registered executor unit: one `entity@version` slot of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Worker {
    /// Stable hash id, see [`Worker::compute_id`].
    pub id: String,
    pub server_id: String,
    pub project: String,
    pub version_label: String,
    pub context: String,
    pub entity: String,
    pub mode: WorkerMode,
    /// Shared-configure key of the backing database.
    pub cfg_key: String,
    pub public_endpoint: String,
    pub intranet_endpoint: String,
    /// Seconds between heartbeat probes from the Gateway.
    pub heartbeat_gap: u64,
    /// Names of CUSTOM executors exposed by this worker.
    pub custom_executors: Vec<String>,
    /// Names of TASK executors exposed by this worker.
    pub task_executors: Vec<String>,
    pub load_rate: f64,
    pub last_heartbeat: i64,
}

impl Worker {
    /// MD5 over the identity tuple; stable within and across processes.
    pub fn compute_id(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}|{}|{}",
            self.server_id,
            self.project,
            self.version_label,
            self.context,
            self.entity,
            self.mode.as_str()
        );
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    /// Label keying the registry lookup: `project.context.entity@version`.
    pub fn entity_label(&self) -> String {
        format!(
            "{}.{}.{}@{}",
            self.project, self.context, self.entity, self.version_label
        )
    }
}

// ============================================================================
// Task
// ============================================================================

/// A durable background task wrapping a deferred event call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: String,
    pub event_id: String,
    pub event_label: String,
    /// Full serialized [`Event`], replayed on execution.
    pub event: String,
    pub status: TaskStatus,
    pub retries: i64,
    /// Server id of the worker that finished the task.
    pub exec_server: String,
    pub created_at: i64,
    /// Not dispatched before this instant (Unix ms).
    pub execute_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Build a pending task from an event, honoring the schema's delay.
    pub fn from_event(event: &Event, delay_secs: i64) -> serde_json::Result<Self> {
        let now = now_millis();
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            event_id: event.id.clone(),
            event_label: event.unique_label(),
            event: serde_json::to_string(event)?,
            status: TaskStatus::Pending,
            retries: 0,
            exec_server: String::new(),
            created_at: now,
            execute_at: now + delay_secs.max(0) * 1_000,
            updated_at: now,
        })
    }
}

// ============================================================================
// Shared configure / endpoints
// ============================================================================

/// A Gateway-owned typed configuration record, cached read-through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedConfigure {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON value; shape depends on `kind` (DB, cache, MQ, AI-model, ...).
    pub value: String,
    pub used_workers: Vec<String>,
}

/// Addressing record for a gateway or worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoint {
    pub server_id: String,
    pub public_host: String,
    pub public_port: u16,
    pub intranet_host: String,
    pub intranet_port: u16,
    #[serde(rename = "type")]
    pub kind: EndpointType,
    pub disabled: bool,
}

impl Endpoint {
    pub fn intranet_addr(&self) -> String {
        format!("{}:{}", self.intranet_host, self.intranet_port)
    }

    pub fn public_addr(&self) -> String {
        format!("{}:{}", self.public_host, self.public_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "evt-1".to_string(),
            project: "demo".to_string(),
            version: "0.0.1".to_string(),
            context: "main".to_string(),
            entity: "user_info".to_string(),
            event: "create".to_string(),
            source: "test".to_string(),
            params: r#"{"name":"alice"}"#.to_string(),
            access_token: String::new(),
            created_at: 1_700_000_000_000,
            sign: String::new(),
        }
    }

    #[test]
    fn test_unique_label() {
        let event = sample_event();
        assert_eq!(event.unique_label(), "demo.main.user_info->create@0.0.1");
        assert_eq!(event.entity_label(), "demo.main.user_info@0.0.1");
    }

    #[test]
    fn test_sign_roundtrip() {
        let mut event = sample_event();
        event.sign_with("secret");
        assert!(event.verify_sign("secret"));
        assert!(!event.verify_sign("other-secret"));

        event.params = r#"{"name":"mallory"}"#.to_string();
        assert!(!event.verify_sign("secret"));
    }

    #[test]
    fn test_empty_sign_never_verifies() {
        let event = sample_event();
        assert!(!event.verify_sign("secret"));
    }

    #[test]
    fn test_worker_id_stable() {
        let worker = Worker {
            server_id: "srv-1".to_string(),
            project: "demo".to_string(),
            version_label: "0.0.1".to_string(),
            context: "main".to_string(),
            entity: "user_info".to_string(),
            mode: WorkerMode::Command,
            ..Default::default()
        };
        let id = worker.compute_id();
        assert_eq!(id, worker.compute_id());
        assert_eq!(id.len(), 32);

        let mut other = worker.clone();
        other.mode = WorkerMode::Query;
        assert_ne!(id, other.compute_id());
    }

    #[test]
    fn test_entity_event_timeout_defaults() {
        let mut entity_event = EntityEvent::default();
        assert_eq!(entity_event.timeout_secs(), 3);
        entity_event.executor_type = ExecutorType::Task;
        assert_eq!(entity_event.timeout_secs(), 10);
        entity_event.timeout = 5;
        assert_eq!(entity_event.timeout_secs(), 5);
    }

    #[test]
    fn test_param_schema_parsing() {
        let entity_event = EntityEvent {
            params: r#"[{"code":"name","required":true,"range":"length:1,64"}]"#.to_string(),
            ..Default::default()
        };
        let schema = entity_event.param_schema();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].code, "name");
        assert!(schema[0].required);

        let broken = EntityEvent {
            params: "not json".to_string(),
            ..Default::default()
        };
        assert!(broken.param_schema().is_empty());
    }

    #[test]
    fn test_task_from_event_applies_delay() {
        let event = sample_event();
        let task = Task::from_event(&event, 30).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.event_label, event.unique_label());
        assert!(task.execute_at >= task.created_at + 30_000);

        let replay: Event = serde_json::from_str(&task.event).unwrap();
        assert_eq!(replay, event);
    }

    #[test]
    fn test_event_wire_field_names() {
        let mut event = sample_event();
        event.access_token = "tok".to_string();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"accessToken\":\"tok\""));
        assert!(json.contains("\"createdAt\":"));
    }

    #[test]
    fn test_task_status_terminality() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
