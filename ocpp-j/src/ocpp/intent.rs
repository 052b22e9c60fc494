//! Application-facing message surface
//!
//! Applications drive the engine with JSON objects of the form
//! `{msgType, cbId, command, data, MessageId}`. The message type reuses the
//! wire tags for CALL, CALLRESULT and CALLERROR, plus [`CONTROL_TAG`] for
//! local management commands that never reach the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dispatcher::CommandInfo;
use super::messages::{ErrorCode, MessageType};
use super::registry::ConnectionInfo;
use crate::error::OcppError;

/// Reserved message type for control commands
pub const CONTROL_TAG: i64 = 99;

const CONTROL_COMMANDS: &[&str] = &["connect", "close", "connections", "cmds"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIntent {
    msg_type: i64,
    #[serde(default)]
    cb_id: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, rename = "MessageId", alias = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    origin: Option<String>,
}

/// Parameters of a `connect` control command; unset fields keep the current value
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default, alias = "cbId")]
    pub station_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub csms_url: Option<String>,
}

/// Local management command
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Reconfigure the target and reconnect now
    Connect(ConnectParams),
    /// Close and stay closed
    Close,
    /// Snapshot of the connection registry
    Connections,
    /// Snapshot of the pending tables
    Commands,
}

impl Control {
    fn parse(command: &str, data: Option<Value>) -> Result<Self, OcppError> {
        match command.to_ascii_lowercase().as_str() {
            "connect" => {
                let mut params: ConnectParams = match data {
                    Some(Value::Null) | None => ConnectParams::default(),
                    Some(value) => serde_json::from_value(value)
                        .map_err(|e| OcppError::InvalidIntent(format!("connect data: {}", e)))?,
                };
                if let Some(url) = params.csms_url.as_mut() {
                    let trimmed = url.trim_end_matches('/').len();
                    url.truncate(trimmed);
                }
                Ok(Control::Connect(params))
            }
            "close" => Ok(Control::Close),
            "connections" => Ok(Control::Connections),
            "cmds" => Ok(Control::Commands),
            _ => Err(OcppError::InvalidIntent(format!(
                "unknown control command \"{}\", expected one of: {}",
                command,
                CONTROL_COMMANDS.join(", ")
            ))),
        }
    }
}

/// One parsed application message
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Call {
        station: Option<String>,
        action: String,
        payload: Value,
        message_id: Option<String>,
        origin: Option<String>,
    },
    Reply {
        station: Option<String>,
        message_id: String,
        payload: Value,
    },
    Error {
        station: Option<String>,
        message_id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    },
    Control(Control),
}

impl Intent {
    pub fn from_value(value: Value) -> Result<Self, OcppError> {
        let raw: RawIntent =
            serde_json::from_value(value).map_err(|e| OcppError::InvalidIntent(e.to_string()))?;

        if raw.msg_type == CONTROL_TAG {
            let command = raw
                .command
                .ok_or_else(|| OcppError::InvalidIntent("control message needs a command".into()))?;
            return Control::parse(&command, raw.data).map(Intent::Control);
        }

        let kind = MessageType::from_tag(raw.msg_type).ok_or_else(|| {
            OcppError::InvalidIntent(format!("unsupported msgType {}", raw.msg_type))
        })?;
        let payload = match raw.data {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(value) => value,
        };

        match kind {
            MessageType::Call => {
                let action = raw
                    .command
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| OcppError::InvalidIntent("CALL needs a command".into()))?;
                Ok(Intent::Call {
                    station: raw.cb_id,
                    action,
                    payload,
                    message_id: raw.message_id,
                    origin: raw.origin,
                })
            }
            MessageType::CallResult => Ok(Intent::Reply {
                station: raw.cb_id,
                message_id: require_id(raw.message_id)?,
                payload,
            }),
            MessageType::CallError => {
                let code = match payload.get("errorCode").and_then(Value::as_str) {
                    Some(code) => code.parse()?,
                    None => ErrorCode::GenericError,
                };
                let description = payload
                    .get("errorDescription")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let details = payload
                    .get("errorDetails")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                Ok(Intent::Error {
                    station: raw.cb_id,
                    message_id: require_id(raw.message_id)?,
                    code,
                    description,
                    details,
                })
            }
        }
    }

    /// Station a server-side intent is addressed to
    pub fn station(&self) -> Option<&str> {
        match self {
            Intent::Call { station, .. }
            | Intent::Reply { station, .. }
            | Intent::Error { station, .. } => station.as_deref(),
            Intent::Control(_) => None,
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| OcppError::InvalidIntent(e.to_string()))?;
        Self::from_value(value)
    }
}

fn require_id(message_id: Option<String>) -> Result<String, OcppError> {
    message_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OcppError::InvalidIntent("reply needs a MessageId".into()))
}

/// Acknowledgement of a processed intent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "receipt", rename_all = "camelCase")]
pub enum Receipt {
    #[serde(rename_all = "camelCase")]
    Sent { message_id: String },
    Connections { connections: Vec<ConnectionInfo> },
    Commands { commands: Vec<CommandInfo> },
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_call_intent() {
        let intent: Intent = r#"{"msgType": 2, "cbId": "CS001", "command": "Heartbeat", "data": {}}"#
            .parse()
            .unwrap();
        match intent {
            Intent::Call { station, action, message_id, .. } => {
                assert_eq!(station.as_deref(), Some("CS001"));
                assert_eq!(action, "Heartbeat");
                assert!(message_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_accepts_both_id_spellings() {
        for key in ["MessageId", "messageId"] {
            let intent = Intent::from_value(json!({"msgType": 3, key: "abc", "data": {"status": "Accepted"}}))
                .unwrap();
            assert!(matches!(intent, Intent::Reply { ref message_id, .. } if message_id == "abc"));
        }

        let missing = Intent::from_value(json!({"msgType": 3, "data": {}}));
        assert!(matches!(missing, Err(OcppError::InvalidIntent(_))));
    }

    #[test]
    fn test_parse_error_intent() {
        let intent = Intent::from_value(json!({
            "msgType": 4,
            "MessageId": "7",
            "data": {"errorCode": "NotSupported", "errorDescription": "nope"}
        }))
        .unwrap();
        match intent {
            Intent::Error { code, description, details, .. } => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "nope");
                assert_eq!(details, json!({}));
            }
            other => panic!("unexpected {:?}", other),
        }

        let bad = Intent::from_value(json!({"msgType": 4, "MessageId": "7", "data": {"errorCode": "Oops"}}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_parse_control_commands() {
        let intent = Intent::from_value(json!({
            "msgType": 99,
            "command": "connect",
            "data": {"cbId": "CS009", "csmsUrl": "ws://example/ocpp/"}
        }))
        .unwrap();
        assert_eq!(
            intent,
            Intent::Control(Control::Connect(ConnectParams {
                station_id: Some("CS009".into()),
                password: None,
                csms_url: Some("ws://example/ocpp".into()),
            }))
        );

        assert_eq!(
            Intent::from_value(json!({"msgType": 99, "command": "cmds"})).unwrap(),
            Intent::Control(Control::Commands)
        );

        // Command names are case-insensitive
        assert_eq!(
            Intent::from_value(json!({"msgType": 99, "command": "Close"})).unwrap(),
            Intent::Control(Control::Close)
        );
        assert_eq!(
            Intent::from_value(json!({"msgType": 99, "command": "CONNECTIONS"})).unwrap(),
            Intent::Control(Control::Connections)
        );
        assert!(matches!(
            Intent::from_value(json!({"msgType": 99, "command": "Connect"})).unwrap(),
            Intent::Control(Control::Connect(_))
        ));

        match Intent::from_value(json!({"msgType": 99, "command": "reboot"})) {
            Err(OcppError::InvalidIntent(msg)) => assert!(msg.contains("connections")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_msg_type() {
        assert!(Intent::from_value(json!({"msgType": 5, "command": "Heartbeat"})).is_err());
    }

    #[test]
    fn test_receipt_serialization() {
        let value = serde_json::to_value(Receipt::Sent { message_id: "abc".into() }).unwrap();
        assert_eq!(value, json!({"receipt": "sent", "messageId": "abc"}));
    }
}
