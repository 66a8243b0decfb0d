//! Public HTTP facade.
//!
//! Accepts external events as `POST <any path>` with a JSON Event body and
//! feeds them through the same validation and dispatch as the intranet
//! surface. A `X-Plugin-Worker` header opts the request into plugin
//! dispatch instead. Development mode turns on permissive CORS and
//! per-request logging.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use matrix_protocol::{Event, EventResponse, ResponseCode};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::context::Surface;
use crate::dispatch::Dispatcher;

/// Header opting a request into plugin dispatch.
pub const PLUGIN_WORKER_HEADER: &str = "x-plugin-worker";

#[derive(Clone)]
pub struct PublicState {
    dispatcher: Arc<Dispatcher>,
    development: bool,
    /// Answer for paths/methods nothing else handles.
    default_status: StatusCode,
}

impl PublicState {
    pub fn new(dispatcher: Arc<Dispatcher>, development: bool) -> Self {
        Self {
            dispatcher,
            development,
            default_status: StatusCode::NOT_IMPLEMENTED,
        }
    }

    pub fn with_default_status(mut self, status: StatusCode) -> Self {
        self.default_status = status;
        self
    }
}

/// Build the public router: every path funnels into one handler.
pub fn router(state: PublicState) -> Router {
    let development = state.development;
    let router = Router::new().fallback(handle).with_state(state);
    if development {
        router.layer(CorsLayer::very_permissive())
    } else {
        router
    }
}

/// Serve until shutdown flips.
pub async fn serve(
    listener: TcpListener,
    state: PublicState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(
        "Public server listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn handle(
    State(state): State<PublicState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if method != Method::POST {
        return state.default_status.into_response();
    }

    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Plugin dispatch when the header names a plugin event type.
    if let Some(code) = plugin_code(&headers) {
        let reply = state
            .dispatcher
            .dispatch_plugin(code, body.to_vec(), source_ip, Surface::Public)
            .await;
        let status = StatusCode::from_u16(reply.status as u16).unwrap_or(StatusCode::OK);
        return (status, reply.payload).into_response();
    }

    let Ok(event) = serde_json::from_slice::<Event>(&body) else {
        let response = EventResponse::error(ResponseCode::FailToProcess, "malformed event body");
        return (StatusCode::BAD_REQUEST, Json(response)).into_response();
    };

    if state.development {
        info!("{} {} {}", method, uri, event.unique_label());
    }

    let (status, response) = state.dispatcher.dispatch_public(event, &source_ip).await;
    let status = StatusCode::from_u16(status as u16).unwrap_or(StatusCode::OK);
    (status, Json(response)).into_response()
}

fn plugin_code(headers: &HeaderMap) -> Option<u16> {
    headers
        .get(PLUGIN_WORKER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u16>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_code_parsing() {
        let mut headers = HeaderMap::new();
        assert!(plugin_code(&headers).is_none());

        headers.insert(PLUGIN_WORKER_HEADER, "30001".parse().unwrap());
        assert_eq!(plugin_code(&headers), Some(30_001));

        headers.insert(PLUGIN_WORKER_HEADER, "not-a-code".parse().unwrap());
        assert!(plugin_code(&headers).is_none());
    }
}
