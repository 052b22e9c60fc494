//! Connection registry (server role)
//!
//! Maps station identity to the live connection serving it. Last writer
//! wins: a station reconnecting under the same identity replaces the older
//! record, and the older connection's close cannot evict the newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::OcppError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What a connection task can be asked to put on its socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Cheap, cloneable handle to one live connection task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its connection task drains
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send_frame(&self, text: String) -> Result<(), OcppError> {
        self.tx
            .send(Outbound::Frame(text))
            .await
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// Ask the connection to close; a no-op if it is already gone
    pub fn close(&self) {
        match self.tx.try_send(Outbound::Close) {
            Ok(()) => {}
            Err(TrySendError::Full(close)) => {
                debug!("Connection #{} outbound queue full, close queued behind it", self.id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(close).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection #{} already gone, nothing to close", self.id);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One registered station connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub identity: String,
    pub since: DateTime<Utc>,
    pub handle: ConnectionHandle,
}

/// Serializable view of a record for the `connections` control command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub identity: String,
    pub since: DateTime<Utc>,
    pub connection_id: u64,
}

/// Identity-addressed table of live connections
#[derive(Clone)]
pub struct ConnectionRegistry {
    records: Arc<RwLock<HashMap<String, ConnectionRecord>>>,
    count: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            count: Arc::new(count),
        }
    }

    /// Record `handle` as the live connection for `identity`
    ///
    /// Returns the handle it displaced, if any; the caller is responsible
    /// for closing it.
    pub fn on_upgrade(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let record = ConnectionRecord {
            identity: identity.to_string(),
            since: Utc::now(),
            handle,
        };

        let (replaced, count) = {
            let mut records = self.records.write();
            let replaced = records.insert(identity.to_string(), record);
            (replaced.map(|r| r.handle), records.len())
        };

        match replaced {
            Some(ref old) => info!(
                "Station {} reconnected, replacing connection #{}",
                identity,
                old.id()
            ),
            None => info!("Station {} connected ({} online)", identity, count),
        }
        self.count.send_replace(count);
        replaced
    }

    /// Drop the record for `identity` if it still belongs to `connection_id`
    ///
    /// Returns whether a record was removed.
    pub fn on_close(&self, identity: &str, connection_id: u64) -> bool {
        let count = {
            let mut records = self.records.write();
            match records.get(identity) {
                Some(record) if record.handle.id() == connection_id => {
                    records.remove(identity);
                    records.len()
                }
                _ => {
                    debug!(
                        "Ignoring close of superseded connection #{} for {}",
                        connection_id, identity
                    );
                    return false;
                }
            }
        };

        info!("Station {} disconnected ({} online)", identity, count);
        self.count.send_replace(count);
        true
    }

    /// Locate the live connection for `identity`
    pub fn route(&self, identity: &str) -> Result<ConnectionHandle, OcppError> {
        self.records
            .read()
            .get(identity)
            .map(|record| record.handle.clone())
            .ok_or_else(|| OcppError::NotConnected {
                station: identity.to_string(),
            })
    }

    pub fn count(&self) -> usize {
        self.records.read().len()
    }

    /// Connected stations sorted by identity
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .records
            .read()
            .values()
            .map(|record| ConnectionInfo {
                identity: record.identity.clone(),
                since: record.since,
                connection_id: record.handle.id(),
            })
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    /// Watch the connection count
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}
