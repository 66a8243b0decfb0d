//! Intranet event types.
//!
//! A u16 carried in the request `x_data` field names the RPC operation.
//! Code 1 is the worker-to-worker event call; 10001-10016 are worker-to-
//! gateway control calls; 20000-20006 are gateway-to-worker pushes; codes at
//! or above [`PLUGIN_EVENT_TYPE_FLOOR`] are reserved for plugins.

use crate::error::{ProtocolError, Result};

/// Lowest event-type code handed to plugins.
pub const PLUGIN_EVENT_TYPE_FLOOR: u16 = 30_000;

/// Highest valid intranet event-type code.
pub const MAX_EVENT_TYPE: u16 = 40_000;

/// Built-in intranet event types (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventType {
    // Worker -> Worker
    WtwEventCall = 1,

    // Worker -> Gateway (control plane)
    WtgRegister = 10001,
    WtgGetEntity = 10002,
    WtgGetEntityAttrs = 10003,
    WtgGetEntityEvents = 10004,
    WtgGetEndpointByEvent = 10005,
    WtgVerifyEvent = 10006,
    WtgVerifyEventWithoutExpired = 10007,
    WtgGetUserIdByUcode = 10008,
    WtgSearchUserInfo = 10009,
    WtgReportConfUsedBy = 10010,
    WtgGetSharedConfigure = 10011,
    WtgGetConstants = 10012,
    WtgReportEndpoint = 10013,
    WtgGetUserDetail = 10014,
    WtgSaveUserSensitiveInfo = 10015,
    WtgGetUserSensitiveInfo = 10016,

    // Gateway -> Worker (control plane)
    GtwCheckWorker = 20000,
    GtwRuleUpdate = 20001,
    GtwSharedConfigureChange = 20002,
    GtwEntityListForDataMgr = 20003,
    GtwResetDomainCache = 20004,
    GtwUpdateRecordForDataMgr = 20005,
    GtwGetLoadRate = 20006,
}

impl EventType {
    pub fn from_u16(value: u16) -> Result<Self> {
        let event_type = match value {
            1 => EventType::WtwEventCall,
            10001 => EventType::WtgRegister,
            10002 => EventType::WtgGetEntity,
            10003 => EventType::WtgGetEntityAttrs,
            10004 => EventType::WtgGetEntityEvents,
            10005 => EventType::WtgGetEndpointByEvent,
            10006 => EventType::WtgVerifyEvent,
            10007 => EventType::WtgVerifyEventWithoutExpired,
            10008 => EventType::WtgGetUserIdByUcode,
            10009 => EventType::WtgSearchUserInfo,
            10010 => EventType::WtgReportConfUsedBy,
            10011 => EventType::WtgGetSharedConfigure,
            10012 => EventType::WtgGetConstants,
            10013 => EventType::WtgReportEndpoint,
            10014 => EventType::WtgGetUserDetail,
            10015 => EventType::WtgSaveUserSensitiveInfo,
            10016 => EventType::WtgGetUserSensitiveInfo,
            20000 => EventType::GtwCheckWorker,
            20001 => EventType::GtwRuleUpdate,
            20002 => EventType::GtwSharedConfigureChange,
            20003 => EventType::GtwEntityListForDataMgr,
            20004 => EventType::GtwResetDomainCache,
            20005 => EventType::GtwUpdateRecordForDataMgr,
            20006 => EventType::GtwGetLoadRate,
            other => return Err(ProtocolError::UnknownEventType(other)),
        };
        Ok(event_type)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Wire form for the request `x_data` field.
    pub fn as_x_data(self) -> String {
        self.as_u16().to_string()
    }
}

/// Whether a raw code is inside the valid intranet range.
pub fn is_intranet_event_type(value: u16) -> bool {
    (1..=MAX_EVENT_TYPE).contains(&value)
}

/// Whether a raw code belongs to the plugin range.
pub fn is_plugin_event_type(value: u16) -> bool {
    (PLUGIN_EVENT_TYPE_FLOOR..=MAX_EVENT_TYPE).contains(&value)
}

/// Parse the `x_data` field of an inbound request into a raw code.
pub fn parse_x_data(x_data: &str) -> Result<u16> {
    let value = x_data
        .trim()
        .parse::<u16>()
        .map_err(|_| ProtocolError::UnknownEventType(0))?;
    if !is_intranet_event_type(value) {
        return Err(ProtocolError::UnknownEventType(value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_codes() {
        for event_type in [
            EventType::WtwEventCall,
            EventType::WtgRegister,
            EventType::WtgGetUserSensitiveInfo,
            EventType::GtwCheckWorker,
            EventType::GtwGetLoadRate,
        ] {
            assert_eq!(
                EventType::from_u16(event_type.as_u16()).unwrap(),
                event_type
            );
        }
    }

    #[test]
    fn test_range_checks() {
        assert!(is_intranet_event_type(1));
        assert!(is_intranet_event_type(40_000));
        assert!(!is_intranet_event_type(0));
        assert!(!is_intranet_event_type(40_001));

        assert!(is_plugin_event_type(30_000));
        assert!(!is_plugin_event_type(29_999));
    }

    #[test]
    fn test_parse_x_data() {
        assert_eq!(parse_x_data("1").unwrap(), 1);
        assert_eq!(parse_x_data(" 30001 ").unwrap(), 30_001);
        assert!(parse_x_data("0").is_err());
        assert!(parse_x_data("40001").is_err());
        assert!(parse_x_data("heartbeat").is_err());
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            EventType::from_u16(10017),
            Err(ProtocolError::UnknownEventType(10017))
        ));
    }
}
