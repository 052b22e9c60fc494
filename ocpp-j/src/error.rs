//! Error taxonomy for the OCPP-J engine
//!
//! Every failure a frame or an application intent can hit maps onto one
//! variant here. Framing errors are dropped with a log line; validation and
//! correlation errors end processing of the one offending message and are
//! reported once; connection errors feed the reconnect path.

use thiserror::Error;

use crate::ocpp::messages::ErrorCode;
use crate::ocpp::schema::{Role, Violation};

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid OCPP2.0.1 command: {0}")]
    UnknownAction(String),

    #[error("{action}{role} payload failed validation: {}", summarize(.violations))]
    Validation {
        action: String,
        role: Role,
        violations: Vec<Violation>,
    },

    #[error("Expired or invalid RESPONSE: {message_id}")]
    Correlation { message_id: String },

    #[error("Target message Id is missing or expired: {message_id}")]
    MissingTarget { message_id: String },

    #[error("Message Id {message_id} is already outstanding")]
    DuplicateMessageId { message_id: String },

    #[error("ChargeBoxId \"{station}\" is not connected")]
    NotConnected { station: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Invalid message: {0}")]
    InvalidIntent(String),

    #[error("Failed to load schema {path}: {reason}")]
    SchemaLoad { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcppError {
    /// True for errors raised while decoding the wire envelope itself.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            OcppError::Json(_) | OcppError::InvalidFormat(_) | OcppError::UnknownMessageType(_)
        )
    }

    /// Wire error code used when this error answers a peer's CALL.
    pub fn call_error_code(&self) -> ErrorCode {
        match self {
            OcppError::Json(_) | OcppError::InvalidFormat(_) => ErrorCode::FormatViolation,
            OcppError::UnknownMessageType(_) => ErrorCode::MessageTypeNotSupported,
            OcppError::UnknownAction(_) => ErrorCode::NotImplemented,
            OcppError::Validation { violations, .. } => violations
                .first()
                .map(|v| code_for_keyword(v.keyword))
                .unwrap_or(ErrorCode::FormatViolation),
            OcppError::DuplicateMessageId { .. } => ErrorCode::ProtocolError,
            _ => ErrorCode::InternalError,
        }
    }
}

fn code_for_keyword(keyword: &str) -> ErrorCode {
    match keyword {
        "type" => ErrorCode::TypeConstraintViolation,
        "required" | "additionalProperties" | "minItems" | "maxItems" => {
            ErrorCode::OccurrenceConstraintViolation
        }
        "enum" | "const" | "minLength" | "maxLength" | "minimum" | "maximum"
        | "exclusiveMinimum" | "exclusiveMaximum" | "format" => {
            ErrorCode::PropertyConstraintViolation
        }
        _ => ErrorCode::FormatViolation,
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
