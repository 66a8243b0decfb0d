//! User-id resolution for inbound events.
//!
//! USER_AUTH events are verified by the Gateway, which owns token validity.
//! Everything else gets a best-effort identity: the access token's JWT
//! payload is decoded without verification, and the contained user code is
//! resolved to an id through a cached Gateway lookup. Failures resolve to
//! an empty user id, never to a rejected request.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use matrix_protocol::{Event, EventResponse, EventType, PayloadType, ResponseCode};
use moka::sync::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::client::IntranetClient;

/// Resolves event identities against the Gateway.
pub struct AuthResolver {
    client: Arc<IntranetClient>,
    gateway: String,
    /// user code -> user id
    ucode_cache: Cache<String, String>,
}

impl AuthResolver {
    pub fn new(
        client: Arc<IntranetClient>,
        gateway: impl Into<String>,
        cache_capacity: u64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            gateway: gateway.into(),
            ucode_cache: Cache::builder()
                .max_capacity(cache_capacity)
                .time_to_live(cache_ttl)
                .build(),
        }
    }

    /// Verify a USER_AUTH event with the Gateway; the reply payload is the
    /// user id on 200 and a response code otherwise.
    ///
    /// `ignore_expiry` selects the without-expired variant, used when a
    /// stored task replays an event whose token has naturally aged out.
    pub async fn verify_event(
        &self,
        event: &Event,
        ignore_expiry: bool,
    ) -> Result<String, EventResponse> {
        let event_type = if ignore_expiry {
            EventType::WtgVerifyEventWithoutExpired
        } else {
            EventType::WtgVerifyEvent
        };

        let payload = serde_json::to_vec(event).map_err(|_| {
            EventResponse::error(ResponseCode::FailToProcess, "unserializable event")
        })?;

        match self
            .client
            .post(&self.gateway, event_type.as_u16(), PayloadType::Json, &payload)
            .await
        {
            Ok(response) if response.status_code == 200 => {
                Ok(String::from_utf8_lossy(&response.payload).into_owned())
            }
            Ok(response) => {
                let code = String::from_utf8_lossy(&response.payload).into_owned();
                let mut denied = EventResponse::error(ResponseCode::FailToProcess, "auth failed");
                if !code.is_empty() {
                    denied.code = code;
                }
                Err(denied)
            }
            Err(e) => {
                debug!("Auth verify call failed: {}", e);
                Err(EventResponse::error(
                    ResponseCode::FailToProcess,
                    "auth verify unavailable",
                ))
            }
        }
    }

    /// Best-effort identity for non-auth events; empty string on any miss.
    pub async fn best_effort_user_id(&self, access_token: &str) -> String {
        let Some(ucode) = decode_ucode(access_token) else {
            return String::new();
        };

        if let Some(user_id) = self.ucode_cache.get(&ucode) {
            return user_id;
        }

        match self
            .client
            .post(
                &self.gateway,
                EventType::WtgGetUserIdByUcode.as_u16(),
                PayloadType::Text,
                ucode.as_bytes(),
            )
            .await
        {
            Ok(response) if response.status_code == 200 => {
                let user_id = String::from_utf8_lossy(&response.payload).into_owned();
                if !user_id.is_empty() {
                    self.ucode_cache.insert(ucode, user_id.clone());
                }
                user_id
            }
            _ => String::new(),
        }
    }
}

/// Pull the user code out of a JWT's payload segment without verifying the
/// signature; identity here is advisory only.
fn decode_ucode(access_token: &str) -> Option<String> {
    let mut segments = access_token.split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    if segments.next().is_none() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims
        .get("ucode")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_claims(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.fakesig")
    }

    #[test]
    fn test_decode_ucode() {
        let token = token_with_claims(&serde_json::json!({"ucode": "u-123", "exp": 0}));
        assert_eq!(decode_ucode(&token).as_deref(), Some("u-123"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_ucode("").is_none());
        assert!(decode_ucode("only-one-segment").is_none());
        assert!(decode_ucode("a.b").is_none());
        assert!(decode_ucode("a.%%%.c").is_none());

        let no_ucode = token_with_claims(&serde_json::json!({"sub": "x"}));
        assert!(decode_ucode(&no_ucode).is_none());
    }
}
