//! OCPP-J protocol implementation
//!
//! - `messages`: JSON array framing (CALL, CALLRESULT, CALLERROR)
//! - `schema`: per-action payload validation
//! - `pending`: outstanding request tracking with expiry
//! - `dispatcher`: inbound/outbound orchestration for either role
//! - `intent`: application message surface and control commands
//! - `client`: charging station connection state machine
//! - `registry`: identity-addressed connection table
//! - `server`: CSMS accept loop

pub mod messages;
pub mod schema;
pub mod pending;
pub mod dispatcher;
pub mod intent;
pub mod client;
pub mod registry;
pub mod server;

pub use messages::*;
pub use schema::{Role, SchemaKey, SchemaRegistry, Violation};
pub use pending::{CorrelationKey, PendingRequest, PendingTable};
pub use dispatcher::{CommandInfo, Direction, Dispatcher, Event, Rejection};
pub use intent::{ConnectParams, Control, Intent, Receipt, CONTROL_TAG};
pub use client::{build_ocpp_url, Backoff, ClientHandle, ConnectionState, LinkStatus, StationClient};
pub use registry::{ConnectionHandle, ConnectionInfo, ConnectionRegistry, Outbound};
pub use server::{Authenticator, BasicAuth, CsmsHandle, CsmsServer};
