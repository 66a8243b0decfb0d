//! Bounded-time executor invocation.
//!
//! Runs the interceptor chain, validates parameters, launches the executor
//! on its own task with a per-event deadline and panic recovery, then runs
//! the response filters. A deadline does not cancel the executor: the
//! leaked computation keeps running, its eventual result is dropped and a
//! panic inside it is still contained by the runtime.

use matrix_protocol::response::status_for;
use matrix_protocol::{EntityAttribute, EventResponse, ExecutorType, ResponseCode};
use matrix_db::{EventLogRecord, EventLogStore, RuntimeLogStore};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::context::EventContext;
use crate::domain::DomainCache;
use crate::executor::{Executor, Filter, FlowControl, Interceptor};
use crate::metrics::ServerMetrics;
use crate::validator::{validate_event_params, CustomParserRegistry};

/// Wall-clock threshold after which a request is flagged slow.
const SLOW_REQUEST: Duration = Duration::from_secs(1);

pub struct Invoker {
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    filters: RwLock<Vec<Arc<dyn Filter>>>,
    custom_parsers: Arc<CustomParserRegistry>,
    domain: Arc<DomainCache>,
    event_log: EventLogStore,
    runtime_log: RuntimeLogStore,
    metrics: Arc<ServerMetrics>,
}

impl Invoker {
    pub fn new(
        domain: Arc<DomainCache>,
        custom_parsers: Arc<CustomParserRegistry>,
        event_log: EventLogStore,
        runtime_log: RuntimeLogStore,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            custom_parsers,
            domain,
            event_log,
            runtime_log,
            metrics,
        }
    }

    /// Append an interceptor; chains run in registration order.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(interceptor);
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(filter);
    }

    /// Run one validated event through its executor.
    ///
    /// Returns the wire status plus the response envelope.
    pub async fn invoke(
        &self,
        mut ctx: EventContext,
        executor: Arc<dyn Executor>,
    ) -> (u32, EventResponse) {
        let started = Instant::now();

        let interceptors: Vec<_> = self
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for interceptor in interceptors {
            if interceptor.intercept(&mut ctx).await == FlowControl::Stop {
                let response = ctx.response.take().unwrap_or_else(|| {
                    EventResponse::error(ResponseCode::ForbiddenCall, "rejected by interceptor")
                });
                return (status_for(&response.code), response);
            }
        }

        let attrs = self
            .domain
            .entity_attrs(
                &ctx.event.project,
                &ctx.event.context,
                &ctx.event.entity,
                &ctx.event.version,
            )
            .await;

        match validate_event_params(
            &ctx.event,
            &ctx.entity_event,
            &attrs,
            &self.domain,
            &self.custom_parsers,
        )
        .await
        {
            Ok(params) => ctx.params = params,
            Err(response) => return (status_for(&response.code), response),
        }

        let deadline = Duration::from_secs(ctx.entity_event.timeout_secs());
        let ctx = Arc::new(ctx);

        let task = tokio::spawn({
            let executor = Arc::clone(&executor);
            let ctx = Arc::clone(&ctx);
            async move { executor.execute(ctx).await }
        });

        let (status, mut response) = match tokio::time::timeout(deadline, task).await {
            Err(_) => {
                warn!("Event {} exceeded its {:?} deadline", ctx.label(), deadline);
                (
                    408,
                    EventResponse::error(ResponseCode::EventTimeout, "event execution timed out"),
                )
            }
            Ok(Err(join_err)) => {
                self.metrics.inc_errors();
                error!("Executor for {} panicked: {}", ctx.label(), join_err);
                self.runtime_log
                    .insert_best_effort(
                        "ERROR",
                        "invoker",
                        &format!("executor panic on {}: {}", ctx.label(), join_err),
                    )
                    .await;
                (
                    500,
                    EventResponse::error(ResponseCode::UnhandledError, "executor failed"),
                )
            }
            Ok(Ok(response)) => (status_for(&response.code), response),
        };

        let elapsed = started.elapsed();
        let slow = elapsed > SLOW_REQUEST;
        if slow {
            warn!("Slow request {} took {:?}", ctx.label(), elapsed);
        }

        let is_task = ctx.entity_event.executor_type == ExecutorType::Task;
        if ctx.entity_event.logable && (response.is_success() || is_task) {
            self.event_log
                .insert_best_effort(&EventLogRecord {
                    event_id: ctx.event.id.clone(),
                    event_label: ctx.label(),
                    user_id: ctx.user_id.clone(),
                    response_code: response.code.clone(),
                    duration_ms: elapsed.as_millis() as i64,
                    slow,
                    source_ip: ctx.source_ip.clone(),
                })
                .await;
        }

        let filters: Vec<_> = self
            .filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for filter in filters {
            if filter.filter(&ctx, &mut response).await == FlowControl::Stop {
                break;
            }
        }

        strip_secrecy_fields(&attrs, &mut response);

        (status, response)
    }
}

/// Remove secrecy attributes from every record of an outbound response.
fn strip_secrecy_fields(attrs: &[EntityAttribute], response: &mut EventResponse) {
    let secret: Vec<&str> = attrs
        .iter()
        .filter(|attr| attr.is_secrecy)
        .map(|attr| attr.code.as_str())
        .collect();
    if secret.is_empty() {
        return;
    }

    for item in &mut response.list {
        if let Some(object) = item.as_object_mut() {
            for code in &secret {
                object.remove(*code);
            }
        }
    }
}
