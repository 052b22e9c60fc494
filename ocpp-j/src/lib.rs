//! # OCPP-J
//!
//! Message exchange engine for OCPP 2.0.1 over WebSocket (OCPP-J), usable
//! as either end of the link.
//!
//! The crate handles the transport envelope only: framing, request/reply
//! correlation, schema validation and connection lifecycle. What a command
//! means is left to the application.
//!
//! ## Architecture
//!
//! ```text
//!  application intents                      application events
//!          │                                        ▲
//!          ▼                                        │
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Dispatcher                         │
//! │  ┌──────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │  │  Codec   │   │ SchemaRegistry│   │ PendingTable x2│   │
//! │  └──────────┘   └───────────────┘   └────────────────┘   │
//! └─────────────┬──────────────────────────────┬─────────────┘
//!               │                              │
//!   ┌───────────▼───────────┐      ┌───────────▼───────────┐
//!   │ StationClient         │      │ CsmsServer            │
//!   │ one link, backoff,    │      │ ConnectionRegistry,   │
//!   │ keepalive             │      │ one task per station  │
//!   └───────────┬───────────┘      └───────────┬───────────┘
//!               │  WebSocket, subprotocol ocpp2.0.1        │
//!               └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_j::{SchemaRegistry, StationClient, StationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schemas = Arc::new(SchemaRegistry::from_dir("ocpp-j/schemas")?);
//!     let config = StationConfig::new("ws://localhost:9220/ocpp", "CS001");
//!
//!     let (client, _handle, mut events) = StationClient::new(config, schemas);
//!     tokio::spawn(client.run());
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ocpp;

pub use config::{BackoffConfig, CsmsConfig, StationConfig};
pub use error::OcppError;

pub use ocpp::{
    Call, CallError, CallResult, ClientHandle, ConnectionState, Control, CsmsHandle, CsmsServer,
    Dispatcher, ErrorCode, Event, Intent, LinkStatus, OcppMessage, Receipt, Role, SchemaRegistry,
    StationClient,
};
