//! Standard JSON response envelope and its closed code set.
//!
//! The `code` is the stable machine-readable result; `message` is the only
//! human-facing string. Every public and intranet event reply uses this
//! envelope, serialized into the response packet payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_millis;
use crate::packet::{PayloadType, ResponsePacket};

/// Wire status code answering an unparsable frame header.
pub const STATUS_INVALID_HEADER: u32 = 40_000;

/// Closed set of business result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Success,
    FailToProcess,
    InvalidParam,
    MissingParam,
    AlreadyExist,
    EventNotExist,
    EntityNotExist,
    UnsupportedEvent,
    ForbiddenCall,
    EventTimeout,
    UnhandledError,
    InvalidSign,
    TaskPending,
    TaskInProgress,
    TaskFailed,
    TaskTimeout,
    TaskUnknown,
}

impl ResponseCode {
    /// Stable wire form; `"0"` is success, everything else an error family.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Success => "0",
            ResponseCode::FailToProcess => "1",
            ResponseCode::InvalidParam => "2",
            ResponseCode::MissingParam => "3",
            ResponseCode::AlreadyExist => "4",
            ResponseCode::EventNotExist => "5",
            ResponseCode::EntityNotExist => "6",
            ResponseCode::UnsupportedEvent => "7",
            ResponseCode::ForbiddenCall => "8",
            ResponseCode::EventTimeout => "9",
            ResponseCode::UnhandledError => "10",
            ResponseCode::InvalidSign => "11",
            ResponseCode::TaskPending => "12",
            ResponseCode::TaskInProgress => "13",
            ResponseCode::TaskFailed => "14",
            ResponseCode::TaskTimeout => "15",
            ResponseCode::TaskUnknown => "16",
        }
    }

    /// HTTP-ish status carried on the wire next to the envelope.
    pub fn status_code(&self) -> u32 {
        match self {
            ResponseCode::Success => 200,
            ResponseCode::InvalidParam | ResponseCode::MissingParam => 400,
            ResponseCode::InvalidSign => 401,
            ResponseCode::ForbiddenCall => 403,
            ResponseCode::EventTimeout => 408,
            ResponseCode::UnhandledError => 500,
            ResponseCode::UnsupportedEvent => 501,
            _ => 200,
        }
    }
}

/// Wire status for a serialized envelope code (the inverse of
/// [`ResponseCode::status_code`] over the closed set; unknown codes map to
/// 200 so plugin-defined codes pass through unharmed).
pub fn status_for(code: &str) -> u32 {
    match code {
        "2" | "3" => 400,
        "11" => 401,
        "8" => 403,
        "9" => 408,
        "10" => 500,
        "7" => 501,
        _ => 200,
    }
}

/// The standard JSON reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub code: String,
    pub created_at: i64,
    pub message: String,
    pub list: Vec<Value>,
    pub total: i64,
    pub size: i64,
    pub page: i64,
}

impl EventResponse {
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            created_at: now_millis(),
            message: message.into(),
            list: Vec::new(),
            total: 0,
            size: 0,
            page: 0,
        }
    }

    pub fn success() -> Self {
        Self::new(ResponseCode::Success, "")
    }

    /// Success carrying a single record.
    pub fn with_record(record: Value) -> Self {
        let mut resp = Self::success();
        resp.list = vec![record];
        resp.total = 1;
        resp.size = 1;
        resp.page = 1;
        resp
    }

    /// Success carrying a page of records.
    pub fn with_page(list: Vec<Value>, total: i64, size: i64, page: i64) -> Self {
        let mut resp = Self::success();
        resp.total = total;
        resp.size = size;
        resp.page = page;
        resp.list = list;
        resp
    }

    pub fn error(code: ResponseCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success.as_str()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Pre-built frame answering an unparsable header. Written verbatim before
/// the connection is closed; never compressed, never encrypted.
pub fn invalid_header_frame() -> Vec<u8> {
    ResponsePacket::new(STATUS_INVALID_HEADER, PayloadType::Text, "invalid header").pack(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let all = [
            ResponseCode::Success,
            ResponseCode::FailToProcess,
            ResponseCode::InvalidParam,
            ResponseCode::MissingParam,
            ResponseCode::AlreadyExist,
            ResponseCode::EventNotExist,
            ResponseCode::EntityNotExist,
            ResponseCode::UnsupportedEvent,
            ResponseCode::ForbiddenCall,
            ResponseCode::EventTimeout,
            ResponseCode::UnhandledError,
            ResponseCode::InvalidSign,
            ResponseCode::TaskPending,
            ResponseCode::TaskInProgress,
            ResponseCode::TaskFailed,
            ResponseCode::TaskTimeout,
            ResponseCode::TaskUnknown,
        ];
        let mut seen = std::collections::HashSet::new();
        for code in all {
            assert!(seen.insert(code.as_str()), "duplicate code {}", code.as_str());
        }
    }

    #[test]
    fn test_envelope_shape() {
        let resp = EventResponse::with_record(serde_json::json!({"id": "1"}));
        let json = resp.to_json();
        for field in ["\"code\"", "\"createdAt\"", "\"message\"", "\"list\"", "\"total\"", "\"size\"", "\"page\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
        assert!(resp.is_success());
    }

    #[test]
    fn test_invalid_header_frame_parses() {
        let frame = invalid_header_frame();
        let header = crate::Header::unpack(&frame[..crate::HEADER_SIZE]).unwrap();
        assert!(!header.compressed);

        let packet =
            ResponsePacket::unpack(&frame[crate::HEADER_SIZE..], false).unwrap();
        assert_eq!(packet.status_code, STATUS_INVALID_HEADER);
        assert_eq!(packet.content_type, PayloadType::Text);
    }
}
