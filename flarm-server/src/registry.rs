//! Live subscriber set and report fan-out.
//!
//! Each subscriber gets a bounded queue. `publish` never waits on a subscriber:
//! - queue full: the report is dropped for that subscriber only (drop-new), it
//!   stays registered
//! - queue closed: the connection loop is gone, the subscriber is removed in the
//!   same pass
//!
//! A report is serialized once per publish and the JSON text is shared by all
//! queues.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use flarm_core::CanonicalReport;

use crate::supervisor::ReportSink;

/// Opaque identity of one subscriber connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    fn new() -> Self {
        ConnectionHandle(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0.simple())
    }
}

/// Result of one publish pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers found dead and removed.
    pub removed: usize,
}

/// Counters since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub removed: u64,
}

pub struct BroadcastRegistry {
    subscribers: Mutex<HashMap<ConnectionHandle, mpsc::Sender<Arc<str>>>>,
    queue_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
    removed: AtomicU64,
}

impl BroadcastRegistry {
    /// `queue_capacity` is the per-subscriber bound, at least 1.
    pub fn new(queue_capacity: usize) -> Self {
        BroadcastRegistry {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, mpsc::Sender<Arc<str>>>> {
        // No code path panics while holding the lock; a poisoned map is still consistent.
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a subscriber. The caller drains the receiver and must `unregister`
    /// when its connection ends.
    pub fn register(&self) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
        let handle = ConnectionHandle::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.lock().insert(handle, tx);
        debug!(%handle, "subscriber registered");
        (handle, rx)
    }

    /// Remove a subscriber. Unknown or already removed handles are ignored.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        if self.lock().remove(handle).is_some() {
            debug!(%handle, "subscriber unregistered");
        }
    }

    /// Number of live subscribers.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            subscribers: self.count(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }

    /// Fan a report out to every subscriber registered at call time.
    pub fn publish(&self, report: &CanonicalReport) -> PublishOutcome {
        let message: Arc<str> = match serde_json::to_string(report) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(id = %report.id, error = %e, "failed to encode report");
                return PublishOutcome::default();
            }
        };
        self.publish_message(message)
    }

    /// Fan out pre-encoded text.
    pub fn publish_message(&self, message: Arc<str>) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        self.lock().retain(|handle, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(%handle, "subscriber queue full, dropping report");
                outcome.dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%handle, "subscriber gone, removing");
                outcome.removed += 1;
                false
            }
        });

        self.published.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        self.removed.fetch_add(outcome.removed as u64, Ordering::Relaxed);
        outcome
    }
}

impl ReportSink for BroadcastRegistry {
    fn on_report(&self, report: &CanonicalReport) {
        self.publish(report);
    }
}
