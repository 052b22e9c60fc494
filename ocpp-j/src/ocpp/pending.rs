//! Pending-request table
//!
//! Tracks in-flight requests keyed by `(station, message id)` so that ids
//! chosen by independent stations never collide. Each entry carries its own
//! expiry timer. Resolution and expiry race under one lock, so exactly one
//! of them removes a given entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::OcppError;

/// Correlation key, scoped to one station
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub station: String,
    pub message_id: String,
}

impl CorrelationKey {
    pub fn new(station: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            message_id: message_id.into(),
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.station, self.message_id)
    }
}

/// A request awaiting its reply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub message_id: String,
    pub action: String,
    pub station: String,
    pub issued_at: DateTime<Utc>,
    /// Opaque routing token handed back with the reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl PendingRequest {
    pub fn new(
        station: impl Into<String>,
        message_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            station: station.into(),
            issued_at: Utc::now(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.station, &self.message_id)
    }
}

struct Slot {
    request: PendingRequest,
    /// Distinguishes this registration from an earlier one under the same key
    ticket: u64,
}

struct Inner {
    name: &'static str,
    entries: Mutex<HashMap<CorrelationKey, Slot>>,
    next_ticket: AtomicU64,
    expired: AtomicU64,
}

/// Shared table of outstanding requests
#[derive(Clone)]
pub struct PendingTable {
    inner: Arc<Inner>,
}

impl PendingTable {
    /// Create an empty table; `name` tags its log lines
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                entries: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                expired: AtomicU64::new(0),
            }),
        }
    }

    /// Insert a new entry and schedule its expiry
    ///
    /// Fails if the key is already outstanding. Must be called from within a
    /// Tokio runtime.
    pub fn register(&self, request: PendingRequest, timeout: Duration) -> Result<(), OcppError> {
        let key = request.key();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(&key) {
                return Err(OcppError::DuplicateMessageId {
                    message_id: key.message_id,
                });
            }
            entries.insert(key.clone(), Slot { request, ticket });
        }

        self.schedule_expiry(key, ticket, timeout);
        Ok(())
    }

    /// Insert an entry, displacing any entry under the same key
    pub fn replace(&self, request: PendingRequest, timeout: Duration) -> Option<PendingRequest> {
        let key = request.key();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        let displaced = self
            .inner
            .entries
            .lock()
            .insert(key.clone(), Slot { request, ticket })
            .map(|slot| slot.request);

        if let Some(ref old) = displaced {
            warn!(
                "[{}] Replaced pending {} ({}) with a new registration",
                self.inner.name, key, old.action
            );
        }

        self.schedule_expiry(key, ticket, timeout);
        displaced
    }

    fn schedule_expiry(&self, key: CorrelationKey, ticket: u64, timeout: Duration) {
        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(&key, ticket);
        });
    }

    /// Remove the entry if it is still the registration the timer was armed for
    fn expire(&self, key: &CorrelationKey, ticket: u64) -> Option<PendingRequest> {
        let mut entries = self.inner.entries.lock();
        if entries.get(key).map(|slot| slot.ticket) != Some(ticket) {
            return None;
        }

        let request = entries.remove(key).map(|slot| slot.request)?;
        drop(entries);

        self.inner.expired.fetch_add(1, Ordering::Relaxed);
        warn!(
            "[{}] Expired Req: id: {}, station: {} cmd: {}",
            self.inner.name, request.message_id, request.station, request.action
        );
        Some(request)
    }

    /// Look up and remove the entry for `key`
    ///
    /// Returns `None` both for ids that never existed and for ids that have
    /// already expired or been resolved.
    pub fn resolve(&self, key: &CorrelationKey) -> Option<PendingRequest> {
        let resolved = self.inner.entries.lock().remove(key).map(|slot| slot.request);
        match resolved {
            Some(ref request) => debug!("[{}] Resolved {} ({})", self.inner.name, key, request.action),
            None => debug!("[{}] No pending entry for {}", self.inner.name, key),
        }
        resolved
    }

    /// Copy of the entry for `key`, leaving it in place
    pub fn peek(&self, key: &CorrelationKey) -> Option<PendingRequest> {
        self.inner.entries.lock().get(key).map(|slot| slot.request.clone())
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries removed by their timer since creation
    pub fn expired_count(&self) -> u64 {
        self.inner.expired.load(Ordering::Relaxed)
    }

    /// Outstanding entries, oldest first
    pub fn snapshot(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> = self
            .inner
            .entries
            .lock()
            .values()
            .map(|slot| slot.request.clone())
            .collect();
        requests.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        requests
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("expired", &self.expired_count())
            .finish()
    }
}
