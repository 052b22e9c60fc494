//! Dispatcher
//!
//! Role-agnostic glue between the codec, the schema gate and the two
//! pending tables. Inbound frames become [`Event`]s or a [`Rejection`];
//! outbound application messages become wire text.
//!
//! - `outgoing` holds CALLs this side issued, awaiting the peer's reply
//! - `incoming` holds peer CALLs awaiting a local reply, so that the reply
//!   can be validated against the original action's Response schema

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::client::LinkStatus;
use super::messages::{Call, CallError, CallResult, ErrorCode, OcppMessage};
use super::pending::{CorrelationKey, PendingRequest, PendingTable};
use super::schema::{Role, SchemaRegistry};
use crate::error::OcppError;

/// Application-visible outcome of protocol activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Validated CALL from the peer; reply with its `message_id`
    #[serde(rename_all = "camelCase")]
    Request {
        #[serde(rename = "cbId")]
        station: String,
        message_id: String,
        action: String,
        payload: Value,
    },

    /// Correlated, validated reply to one of our CALLs
    #[serde(rename_all = "camelCase")]
    Response {
        #[serde(rename = "cbId")]
        station: String,
        message_id: String,
        action: String,
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    /// Correlated CALLERROR answering one of our CALLs
    #[serde(rename_all = "camelCase")]
    CallError {
        #[serde(rename = "cbId")]
        station: String,
        message_id: String,
        action: String,
        error_code: ErrorCode,
        error_description: String,
        error_details: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    /// A message this side refused to process
    #[serde(rename_all = "camelCase")]
    Rejected {
        #[serde(rename = "cbId")]
        station: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        error: String,
    },

    /// Client link went online or offline
    Status {
        #[serde(rename = "cbId")]
        station: String,
        status: LinkStatus,
    },

    /// Server connection count changed
    Connections { count: usize },
}

impl Event {
    pub fn rejected(station: &str, message_id: Option<&str>, error: &OcppError) -> Self {
        Event::Rejected {
            station: station.to_string(),
            message_id: message_id.map(str::to_string),
            error: error.to_string(),
        }
    }
}

/// Why an inbound frame produced no event
#[derive(Debug)]
pub struct Rejection {
    pub message_id: Option<String>,
    pub error: OcppError,
    /// CALLERROR to send back, if the frame was a CALL and replies are enabled
    pub reply: Option<CallError>,
}

impl Rejection {
    fn local(message_id: Option<String>, error: OcppError) -> Self {
        Self {
            message_id,
            error,
            reply: None,
        }
    }

    pub fn to_event(&self, station: &str) -> Event {
        Event::rejected(station, self.message_id.as_deref(), &self.error)
    }
}

/// Row of the `cmds` snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub direction: Direction,
    #[serde(rename = "cbId")]
    pub station: String,
    pub message_id: String,
    pub action: String,
    pub age_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Correlates and validates traffic for one or many stations
#[derive(Debug, Clone)]
pub struct Dispatcher {
    schemas: Arc<SchemaRegistry>,
    outgoing: PendingTable,
    incoming: PendingTable,
    timeout: Duration,
    reply_call_errors: bool,
}

impl Dispatcher {
    pub fn new(schemas: Arc<SchemaRegistry>, timeout: Duration, reply_call_errors: bool) -> Self {
        Self {
            schemas,
            outgoing: PendingTable::new("outgoing"),
            incoming: PendingTable::new("incoming"),
            timeout,
            reply_call_errors,
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn outgoing(&self) -> &PendingTable {
        &self.outgoing
    }

    pub fn incoming(&self) -> &PendingTable {
        &self.incoming
    }

    /// Process one inbound frame received from `station`
    pub fn handle_inbound(&self, station: &str, raw: &str) -> Result<Event, Rejection> {
        let message = OcppMessage::parse_str(raw).map_err(|e| {
            warn!("[{}] Dropping undecodable frame: {} ({})", station, e, raw);
            Rejection::local(None, e)
        })?;

        match message {
            OcppMessage::Call(call) => self.inbound_call(station, call),
            OcppMessage::CallResult(result) => self.inbound_result(station, result),
            OcppMessage::CallError(error) => self.inbound_error(station, error),
        }
    }

    fn inbound_call(&self, station: &str, call: Call) -> Result<Event, Rejection> {
        debug!("[{}] Received CALL {} {}", station, call.action, call.message_id);

        if let Err(e) = self.schemas.validate(&call.action, Role::Request, &call.payload) {
            warn!("[{}] Rejected CALL {}: {}", station, call.message_id, e);
            let reply = self
                .reply_call_errors
                .then(|| CallError::new(&call.message_id, e.call_error_code(), e.to_string()));
            return Err(Rejection {
                message_id: Some(call.message_id),
                error: e,
                reply,
            });
        }

        self.incoming.replace(
            PendingRequest::new(station, &call.message_id, &call.action),
            self.timeout,
        );

        Ok(Event::Request {
            station: station.to_string(),
            message_id: call.message_id,
            action: call.action,
            payload: call.payload,
        })
    }

    fn inbound_result(&self, station: &str, result: CallResult) -> Result<Event, Rejection> {
        let key = CorrelationKey::new(station, &result.message_id);
        let request = self.outgoing.resolve(&key).ok_or_else(|| {
            warn!("[{}] Expired or invalid RESPONSE: {}", station, result.message_id);
            Rejection::local(
                Some(result.message_id.clone()),
                OcppError::Correlation {
                    message_id: result.message_id.clone(),
                },
            )
        })?;

        if let Err(e) = self
            .schemas
            .validate(&request.action, Role::Response, &result.payload)
        {
            warn!("[{}] Rejected RESPONSE {}: {}", station, result.message_id, e);
            return Err(Rejection::local(Some(result.message_id), e));
        }

        Ok(Event::Response {
            station: station.to_string(),
            message_id: result.message_id,
            action: request.action,
            payload: result.payload,
            origin: request.origin,
        })
    }

    fn inbound_error(&self, station: &str, error: CallError) -> Result<Event, Rejection> {
        let key = CorrelationKey::new(station, &error.message_id);
        let request = self.outgoing.resolve(&key).ok_or_else(|| {
            warn!("[{}] Expired or invalid CALLERROR: {}", station, error.message_id);
            Rejection::local(
                Some(error.message_id.clone()),
                OcppError::Correlation {
                    message_id: error.message_id.clone(),
                },
            )
        })?;

        warn!(
            "[{}] {} {} answered with {}: {}",
            station, request.action, error.message_id, error.error_code, error.error_description
        );

        Ok(Event::CallError {
            station: station.to_string(),
            message_id: error.message_id,
            action: request.action,
            error_code: error.error_code,
            error_description: error.error_description,
            error_details: error.error_details,
            origin: request.origin,
        })
    }

    /// Validate and register an outbound CALL, returning its wire text
    pub fn prepare_call(
        &self,
        station: &str,
        call: &Call,
        origin: Option<String>,
    ) -> Result<String, OcppError> {
        self.schemas.validate(&call.action, Role::Request, &call.payload)?;

        let request = PendingRequest::new(station, &call.message_id, &call.action).with_origin(origin);
        self.outgoing.register(request, self.timeout)?;

        debug!("[{}] Sending CALL {} {}", station, call.action, call.message_id);
        Ok(OcppMessage::Call(call.clone()).to_text())
    }

    /// Forget an outbound CALL that never made it onto the wire
    pub fn cancel_call(&self, station: &str, message_id: &str) {
        self.outgoing.resolve(&CorrelationKey::new(station, message_id));
    }

    /// Validate a reply to the peer CALL `message_id`, returning its wire text
    pub fn prepare_result(
        &self,
        station: &str,
        message_id: &str,
        payload: Value,
    ) -> Result<String, OcppError> {
        let key = CorrelationKey::new(station, message_id);
        let missing = || OcppError::MissingTarget {
            message_id: message_id.to_string(),
        };

        let request = self.incoming.peek(&key).ok_or_else(missing)?;
        self.schemas.validate(&request.action, Role::Response, &payload)?;
        self.incoming.resolve(&key).ok_or_else(missing)?;

        Ok(OcppMessage::CallResult(CallResult::new(message_id, payload)).to_text())
    }

    /// Build a CALLERROR answering the peer CALL `message_id`
    pub fn prepare_error(
        &self,
        station: &str,
        message_id: &str,
        code: ErrorCode,
        description: &str,
        details: Value,
    ) -> Result<String, OcppError> {
        let key = CorrelationKey::new(station, message_id);
        self.incoming
            .resolve(&key)
            .ok_or_else(|| OcppError::MissingTarget {
                message_id: message_id.to_string(),
            })?;

        let error = CallError::new(message_id, code, description).with_details(details);
        Ok(OcppMessage::CallError(error).to_text())
    }

    /// Both pending tables, oldest first within each direction
    pub fn snapshot(&self) -> Vec<CommandInfo> {
        let now = Utc::now();
        let rows = |direction: Direction, table: &PendingTable| {
            table
                .snapshot()
                .into_iter()
                .map(move |request| CommandInfo {
                    direction,
                    station: request.station,
                    message_id: request.message_id,
                    action: request.action,
                    age_ms: (now - request.issued_at).num_milliseconds(),
                    origin: request.origin,
                })
                .collect::<Vec<_>>()
        };

        let mut all = rows(Direction::Outgoing, &self.outgoing);
        all.extend(rows(Direction::Incoming, &self.incoming));
        all
    }
}
