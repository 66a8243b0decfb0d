//! Inbound event routing.
//!
//! The intranet surface routes on the request's `x_data` event-type code:
//! control codes go to built-in handlers, code 1 is the worker-to-worker
//! event call, and the plugin range is handed to whichever plugin claimed
//! the code. The public surface accepts the same event calls minus TASK
//! executors and INTERNAL_AUTH events.

use async_trait::async_trait;
use dashmap::DashMap;
use matrix_db::records::EntityKey;
use matrix_db::RecordStore;
use matrix_protocol::defaults::SPLIT;
use matrix_protocol::event_type::{is_plugin_event_type, parse_x_data};
use matrix_protocol::response::status_for;
use matrix_protocol::{
    AuthType, Event, EventResponse, EventType, ExecutorType, PayloadType, RequestPacket,
    ResponseCode, SharedConfigure, TaskStatus, WorkerServerConfig,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::auth::AuthResolver;
use crate::context::{EventContext, Surface};
use crate::domain::DomainCache;
use crate::executor::builtin_executor;
use crate::invoker::Invoker;
use crate::load::LoadProbe;
use crate::registry::WorkerRegistry;
use crate::shared_configure::SharedConfigureStore;

/// What a dispatch produced, ready for framing.
#[derive(Debug, Clone)]
pub struct DispatchReply {
    pub status: u32,
    pub content_type: PayloadType,
    pub payload: Vec<u8>,
}

impl DispatchReply {
    pub fn envelope(status: u32, response: &EventResponse) -> Self {
        Self {
            status,
            content_type: PayloadType::Json,
            payload: response.to_json().into_bytes(),
        }
    }

    fn text(status: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: PayloadType::Text,
            payload: payload.into(),
        }
    }

    fn code(code: ResponseCode, message: &str) -> Self {
        let response = EventResponse::error(code, message);
        Self::envelope(status_for(&response.code), &response)
    }
}

/// An intranet plugin: claims a set of event-type codes at or above the
/// plugin floor and handles whatever arrives on them.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn event_types(&self) -> Vec<u16>;
    async fn handle(&self, request: PluginRequest) -> EventResponse;
}

/// Inbound data handed to a plugin.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    pub code: u16,
    /// Decrypted application payload.
    pub payload: Vec<u8>,
    pub source_ip: String,
    pub surface: Surface,
}

/// Handler invoked when the Gateway pushes a rule update.
pub type RuleUpdateHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Payload of an update-record push from the Gateway's data manager.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRecordPush {
    project: String,
    context: String,
    entity: String,
    id: String,
    data: Value,
}

pub struct Dispatcher {
    config: WorkerServerConfig,
    domain: Arc<DomainCache>,
    registry: Arc<WorkerRegistry>,
    invoker: Arc<Invoker>,
    shared: Arc<SharedConfigureStore>,
    records: RecordStore,
    load: Arc<LoadProbe>,
    auth: Arc<AuthResolver>,
    plugins: DashMap<u16, Arc<dyn Plugin>>,
    rule_update_handler: RwLock<Option<RuleUpdateHandler>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerServerConfig,
        domain: Arc<DomainCache>,
        registry: Arc<WorkerRegistry>,
        invoker: Arc<Invoker>,
        shared: Arc<SharedConfigureStore>,
        records: RecordStore,
        load: Arc<LoadProbe>,
        auth: Arc<AuthResolver>,
    ) -> Self {
        Self {
            config,
            domain,
            registry,
            invoker,
            shared,
            records,
            load,
            auth,
            plugins: DashMap::new(),
            rule_update_handler: RwLock::new(None),
        }
    }

    /// Map every code the plugin declares to it. Codes outside the plugin
    /// range are refused.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> anyhow::Result<()> {
        for code in plugin.event_types() {
            if !is_plugin_event_type(code) {
                anyhow::bail!("event type {code} is outside the plugin range");
            }
            self.plugins.insert(code, Arc::clone(&plugin));
            info!("Plugin registered for event type {}", code);
        }
        Ok(())
    }

    pub fn set_rule_update_handler(&self, handler: RuleUpdateHandler) {
        *self
            .rule_update_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn plugin_for(&self, code: u16) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(&code).map(|e| Arc::clone(e.value()))
    }

    /// Route one decrypted intranet request.
    pub async fn dispatch_intranet(&self, request: &RequestPacket) -> DispatchReply {
        let code = match parse_x_data(&request.x_data) {
            Ok(code) => code,
            Err(_) => {
                return DispatchReply::code(ResponseCode::UnsupportedEvent, "unknown event type")
            }
        };

        if is_plugin_event_type(code) {
            return self
                .dispatch_plugin(
                    code,
                    request.payload.clone(),
                    request.source_ip.clone(),
                    Surface::Intranet,
                )
                .await;
        }

        let Ok(event_type) = EventType::from_u16(code) else {
            return DispatchReply::code(ResponseCode::UnsupportedEvent, "unknown event type");
        };

        match event_type {
            EventType::WtwEventCall => {
                self.handle_event_call(
                    &request.payload,
                    &request.source_ip,
                    &request.call_chain,
                    Surface::Intranet,
                )
                .await
            }
            EventType::GtwCheckWorker => {
                let ids = String::from_utf8_lossy(&request.payload);
                let replies = self.registry.check_workers(&ids);
                match serde_json::to_vec(&replies) {
                    Ok(payload) => DispatchReply {
                        status: 200,
                        content_type: PayloadType::Json,
                        payload,
                    },
                    Err(e) => DispatchReply::code(ResponseCode::UnhandledError, &e.to_string()),
                }
            }
            EventType::GtwRuleUpdate => {
                let handler = self
                    .rule_update_handler
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(handler) = handler {
                    handler(&String::from_utf8_lossy(&request.payload));
                }
                DispatchReply::envelope(200, &EventResponse::success())
            }
            EventType::GtwSharedConfigureChange => {
                match serde_json::from_slice::<SharedConfigure>(&request.payload) {
                    Ok(configure) => {
                        self.shared.handle_change(configure);
                        DispatchReply::envelope(200, &EventResponse::success())
                    }
                    Err(_) => DispatchReply::code(
                        ResponseCode::FailToProcess,
                        "malformed shared configure",
                    ),
                }
            }
            EventType::GtwEntityListForDataMgr => {
                let records = self.registry.worker_records();
                let list = records
                    .into_iter()
                    .filter_map(|record| serde_json::to_value(record).ok())
                    .collect::<Vec<_>>();
                let total = list.len() as i64;
                let response = EventResponse::with_page(list, total, total, 1);
                DispatchReply::envelope(200, &response)
            }
            EventType::GtwResetDomainCache => {
                self.domain.flush();
                DispatchReply::envelope(200, &EventResponse::success())
            }
            EventType::GtwUpdateRecordForDataMgr => self.handle_update_record(&request.payload).await,
            EventType::GtwGetLoadRate => {
                let rate = self.load.load_rate();
                DispatchReply::text(200, format!("{rate:.2}"))
            }
            // Worker-to-gateway calls have no business arriving here.
            _ => DispatchReply::code(ResponseCode::UnsupportedEvent, "unsupported event type"),
        }
    }

    /// Route a public HTTP event; TASK and INTERNAL_AUTH are forbidden.
    pub async fn dispatch_public(&self, event: Event, source_ip: &str) -> (u32, EventResponse) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(_) => {
                let response =
                    EventResponse::error(ResponseCode::FailToProcess, "unserializable event");
                return (400, response);
            }
        };
        let reply = self
            .handle_event_call(&payload, source_ip, "", Surface::Public)
            .await;
        let response = serde_json::from_slice::<EventResponse>(&reply.payload).unwrap_or_else(|_| {
            EventResponse::error(ResponseCode::UnhandledError, "malformed internal reply")
        });
        (reply.status, response)
    }

    /// Hand a request to the plugin owning its code.
    pub async fn dispatch_plugin(
        &self,
        code: u16,
        payload: Vec<u8>,
        source_ip: String,
        surface: Surface,
    ) -> DispatchReply {
        let Some(plugin) = self.plugin_for(code) else {
            return DispatchReply::code(ResponseCode::UnsupportedEvent, "no plugin for event type");
        };
        let response = plugin
            .handle(PluginRequest {
                code,
                payload,
                source_ip,
                surface,
            })
            .await;
        DispatchReply::envelope(status_for(&response.code), &response)
    }

    /// The worker-to-worker event call: validate, authenticate, execute.
    async fn handle_event_call(
        &self,
        payload: &[u8],
        source_ip: &str,
        call_chain: &str,
        surface: Surface,
    ) -> DispatchReply {
        let Ok(event) = serde_json::from_slice::<Event>(payload) else {
            let response = EventResponse::error(ResponseCode::FailToProcess, "malformed event");
            return DispatchReply::envelope(400, &response);
        };

        if !event.verify_sign(&self.config.intranet_secret) {
            let response = EventResponse::error(ResponseCode::InvalidSign, "signature mismatch");
            return DispatchReply::envelope(401, &response);
        }

        let Some(entity_event) = self.domain.find_entity_event(&event).await else {
            return DispatchReply::code(ResponseCode::EventNotExist, "event is not registered");
        };

        let Some(worker) = self.registry.worker_by_event(&event.entity_label()) else {
            return DispatchReply::code(
                ResponseCode::EntityNotExist,
                "entity is not served by this worker",
            );
        };

        if surface == Surface::Public
            && (entity_event.executor_type == ExecutorType::Task
                || entity_event.auth_type == AuthType::InternalAuth)
        {
            let response =
                EventResponse::error(ResponseCode::ForbiddenCall, "not callable from public");
            return DispatchReply::envelope(403, &response);
        }

        // Identity resolution; USER_AUTH delegates validity to the Gateway.
        let user_id = match entity_event.auth_type {
            AuthType::UserAuth => {
                let ignore_expiry = surface == Surface::Intranet
                    && entity_event.executor_type == ExecutorType::Task;
                match self.auth.verify_event(&event, ignore_expiry).await {
                    Ok(user_id) => user_id,
                    Err(response) => return DispatchReply::envelope(401, &response),
                }
            }
            _ => self.auth.best_effort_user_id(&event.access_token).await,
        };

        let mut ctx = EventContext::new(event, entity_event.clone(), surface);
        ctx.user_id = user_id;
        ctx.source_ip = source_ip.to_string();
        ctx.call_chain = call_chain.to_string();

        match entity_event.executor_type {
            ExecutorType::Task => self.run_task_executor(ctx, &worker.task_executors).await,
            ExecutorType::Custom => {
                let Some(executor) = worker.custom_executors.get(&entity_event.executor) else {
                    return DispatchReply::code(
                        ResponseCode::UnsupportedEvent,
                        "no such custom executor",
                    );
                };
                let (status, response) = self.invoker.invoke(ctx, Arc::clone(executor)).await;
                DispatchReply::envelope(status, &response)
            }
            ExecutorType::Builtin => {
                let Some(executor) = builtin_executor(&entity_event.executor, &self.records)
                else {
                    return DispatchReply::code(
                        ResponseCode::UnsupportedEvent,
                        "no such builtin executor",
                    );
                };
                let (status, response) = self.invoker.invoke(ctx, executor).await;
                DispatchReply::envelope(status, &response)
            }
        }
    }

    /// Execute a TASK event in place. The caller is the task loop of some
    /// worker; the compact `STATUS|server_id` reply feeds its bookkeeping.
    async fn run_task_executor(
        &self,
        ctx: EventContext,
        executors: &std::collections::HashMap<String, Arc<dyn crate::executor::Executor>>,
    ) -> DispatchReply {
        let Some(executor) = executors.get(&ctx.entity_event.executor) else {
            return DispatchReply::text(
                200,
                format!(
                    "{}{}{}",
                    TaskStatus::Failed.as_str(),
                    SPLIT,
                    self.config.server_id
                ),
            );
        };

        let (_, response) = self.invoker.invoke(ctx, Arc::clone(executor)).await;
        let status = if response.is_success() {
            TaskStatus::Success
        } else if response.code == ResponseCode::EventTimeout.as_str() {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };

        DispatchReply::text(
            200,
            format!("{}{}{}", status.as_str(), SPLIT, self.config.server_id),
        )
    }

    async fn handle_update_record(&self, payload: &[u8]) -> DispatchReply {
        if self.config.not_accept_update_record_event_from_gateway {
            let response = EventResponse::error(
                ResponseCode::ForbiddenCall,
                "update-record events are disabled",
            );
            return DispatchReply::envelope(403, &response);
        }

        let Ok(push) = serde_json::from_slice::<UpdateRecordPush>(payload) else {
            return DispatchReply::code(ResponseCode::FailToProcess, "malformed record push");
        };

        let key = EntityKey {
            project: push.project,
            context: push.context,
            entity: push.entity,
        };
        let result = match self.records.update(&key, &push.id, &push.data).await {
            Err(matrix_db::DbError::NotFound(_)) => {
                self.records.insert(&key, &push.id, &push.data).await
            }
            other => other,
        };

        match result {
            Ok(()) => DispatchReply::envelope(200, &EventResponse::success()),
            Err(e) => {
                warn!("Record push failed: {}", e);
                DispatchReply::code(ResponseCode::FailToProcess, &e.to_string())
            }
        }
    }
}
