//! Configuration for both OCPP-J roles
//!
//! - [`StationConfig`]: a charging station connecting out to a CSMS
//! - [`CsmsConfig`]: a CSMS accepting many station connections
//! - [`BackoffConfig`]: reconnect pacing shared by the client role

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Reconnect backoff: linear from `min` by `increment`, clamped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub increment: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(360),
            increment: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    pub fn new(min: Duration, max: Duration, increment: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            increment,
        }
    }
}

/// Charging station (client role) configuration
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Station identity, appended to the URL path
    pub station_id: String,

    /// Basic auth password; the station id is the user name
    pub password: Option<String>,

    /// Connect as soon as the client starts
    pub auto_connect: bool,

    /// How long an outstanding request waits for its reply
    pub message_timeout: Duration,

    pub backoff: BackoffConfig,

    /// Keepalive ping period while open
    pub ping_interval: Duration,

    /// Upper bound on the TCP + WebSocket handshake
    pub connect_timeout: Duration,

    /// Answer rejected inbound CALLs with a CALLERROR
    pub reply_call_errors: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:9220/ocpp".to_string(),
            station_id: "CS001".to_string(),
            password: None,
            auto_connect: true,
            message_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            reply_call_errors: true,
        }
    }
}

impl StationConfig {
    pub fn new(csms_url: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            station_id: station_id.into(),
            ..Default::default()
        }
    }

    /// Set basic auth password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Start idle until a `connect` control command arrives
    pub fn without_auto_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Keep rejected inbound CALLs local instead of replying with a CALLERROR
    pub fn without_call_error_replies(mut self) -> Self {
        self.reply_call_errors = false;
        self
    }
}

/// CSMS (server role) configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Address to accept WebSocket connections on
    pub listen: SocketAddr,

    /// Path prefix; the station identity is the one segment after it
    pub base_path: String,

    pub message_timeout: Duration,

    /// Basic auth credentials by station identity; empty disables auth
    pub users: HashMap<String, String>,

    pub reply_call_errors: bool,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9220)),
            base_path: "/ocpp".to_string(),
            message_timeout: Duration::from_secs(10),
            users: HashMap::new(),
            reply_call_errors: true,
        }
    }
}

impl CsmsConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// Set the path prefix; a trailing '/' is dropped
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.base_path = path.trim_end_matches('/').to_string();
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Add a station allowed to connect with the given password
    pub fn with_user(mut self, station: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(station.into(), password.into());
        self
    }

    pub fn without_call_error_replies(mut self) -> Self {
        self.reply_call_errors = false;
        self
    }
}
