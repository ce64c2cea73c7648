//! Wire frames
//!
//! Client to gateway: `{"channel": "...", "event"?: "...", "data"?: any}`.
//! Gateway to client: `{"channel": "...", "event": "...", "data"?: any}` with
//! `data` omitted entirely when there is no payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A frame received from the client, before routing.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub channel: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Event names a session can register handlers for.
///
/// `Close` and `Error` are lifecycle signals raised locally by the
/// multiplexer. A client can never produce them: [`EventName::from_client`]
/// folds those names into `Data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    Data,
    Close,
    Error,
    Named(String),
}

impl EventName {
    pub const DATA: &'static str = "data";
    pub const CLOSE: &'static str = "close";
    pub const ERROR: &'static str = "error";

    pub fn parse(name: &str) -> Self {
        match name {
            Self::DATA => EventName::Data,
            Self::CLOSE => EventName::Close,
            Self::ERROR => EventName::Error,
            other => EventName::Named(other.to_string()),
        }
    }

    /// Resolve the event name of a client frame.
    ///
    /// Missing names default to `data`. Reserved lifecycle names are rejected
    /// and remapped to `data`; the rejected name is returned alongside so the
    /// caller can report it.
    pub fn from_client(event: Option<&str>) -> (Self, Option<&str>) {
        match event {
            None => (EventName::Data, None),
            Some(name @ (Self::CLOSE | Self::ERROR)) => (EventName::Data, Some(name)),
            Some(name) => (Self::parse(name), None),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventName::Data => Self::DATA,
            EventName::Close => Self::CLOSE,
            EventName::Error => Self::ERROR,
            EventName::Named(name) => name,
        }
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_frame_all_fields() {
        let frame = InboundFrame::parse(r#"{"channel":"presence","event":"monitor","data":"alice"}"#)
            .unwrap();
        assert_eq!(frame.channel.as_deref(), Some("presence"));
        assert_eq!(frame.event.as_deref(), Some("monitor"));
        assert_eq!(frame.data, Some(json!("alice")));
    }

    #[test]
    fn test_inbound_frame_without_event_or_data() {
        let frame = InboundFrame::parse(r#"{"channel":"presence"}"#).unwrap();
        assert_eq!(frame.channel.as_deref(), Some("presence"));
        assert!(frame.event.is_none());
        assert!(frame.data.is_none());
    }

    #[test]
    fn test_inbound_frame_rejects_non_json() {
        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse("[1, 2]").is_err());
    }

    #[test]
    fn test_outbound_frame_omits_missing_data() {
        let frame = OutboundFrame {
            channel: "presence".to_string(),
            event: "ready".to_string(),
            data: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"channel":"presence","event":"ready"}"#);
    }

    #[test]
    fn test_outbound_frame_includes_data() {
        let frame = OutboundFrame {
            channel: "presence".to_string(),
            event: "online".to_string(),
            data: Some(json!("alice")),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"channel": "presence", "event": "online", "data": "alice"})
        );
    }

    #[test]
    fn test_client_event_defaults_to_data() {
        assert_eq!(EventName::from_client(None), (EventName::Data, None));
    }

    #[test]
    fn test_client_cannot_raise_lifecycle_events() {
        assert_eq!(
            EventName::from_client(Some("close")),
            (EventName::Data, Some("close"))
        );
        assert_eq!(
            EventName::from_client(Some("error")),
            (EventName::Data, Some("error"))
        );
    }

    #[test]
    fn test_client_named_event() {
        assert_eq!(
            EventName::from_client(Some("connectas")),
            (EventName::Named("connectas".to_string()), None)
        );
        assert_eq!(EventName::from_client(Some("data")), (EventName::Data, None));
    }

    #[test]
    fn test_event_name_round_trips_through_str() {
        for name in ["data", "close", "error", "monitor"] {
            assert_eq!(EventName::parse(name).as_str(), name);
        }
    }
}
