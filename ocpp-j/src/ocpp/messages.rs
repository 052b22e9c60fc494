//! OCPP-J message framing
//!
//! OCPP-J carries JSON arrays over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding tolerates senders that drop the enclosing brackets; encoding
//! always produces the canonical array form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::OcppError;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| OcppError::InvalidIntent(format!("unknown error code: {}", s)))
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    /// Create a CALL message with a caller-chosen ID
    pub fn with_id(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ])
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: empty_object(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ])
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from raw frame bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| OcppError::InvalidFormat("frame is not valid UTF-8"))?;
        Self::parse_str(text)
    }

    /// Parse an OCPP message from frame text
    ///
    /// Some charging stations send the envelope without its enclosing
    /// brackets; such frames are wrapped before parsing.
    pub fn parse_str(text: &str) -> Result<Self, OcppError> {
        let text = text.trim();
        let array: Vec<Value> = if text.starts_with('[') {
            serde_json::from_str(text)?
        } else {
            serde_json::from_str(&format!("[{}]", text))?
        };

        if array.len() < 2 {
            return Err(OcppError::InvalidFormat("envelope needs a type and a message id"));
        }

        let tag = array[0]
            .as_i64()
            .ok_or(OcppError::InvalidFormat("message type is not an integer"))?;
        let msg_type = MessageType::from_tag(tag).ok_or(OcppError::UnknownMessageType(tag))?;

        let message_id = array[1]
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or(OcppError::InvalidFormat("message id must be a non-empty string"))?
            .to_string();

        match msg_type {
            MessageType::Call => {
                // CALL: [2, messageId, action, payload]
                if array.len() > 4 {
                    return Err(OcppError::InvalidFormat("CALL has too many elements"));
                }

                let action = array
                    .get(2)
                    .and_then(Value::as_str)
                    .filter(|a| !a.is_empty())
                    .ok_or(OcppError::InvalidFormat("CALL action must be a non-empty string"))?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: payload_at(&array, 3),
                }))
            }
            MessageType::CallResult => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() > 3 {
                    return Err(OcppError::InvalidFormat("CALLRESULT has too many elements"));
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: payload_at(&array, 2),
                }))
            }
            MessageType::CallError => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() < 3 || array.len() > 5 {
                    return Err(OcppError::InvalidFormat("CALLERROR needs 3 to 5 elements"));
                }

                let error_code = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("CALLERROR code must be a string"))?
                    .parse()
                    .unwrap_or(ErrorCode::GenericError);

                let error_description = array
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: payload_at(&array, 4),
                }))
            }
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Canonical array form of this message
    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to frame text
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

/// Missing or null payloads are read as an empty object.
fn payload_at(array: &[Value], index: usize) -> Value {
    match array.get(index) {
        None | Some(Value::Null) => empty_object(),
        Some(v) => v.clone(),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
