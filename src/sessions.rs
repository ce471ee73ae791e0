//! TCP session tracking and connection statistics.
//!
//! Counters are lock-free atomics; the statistics snapshot reads each
//! counter separately and is recomputed on every call, never cached. The
//! snapshot is not required to be cross-counter consistent.

use crate::frame::SessionId;
use crate::{lock_read, lock_write};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Per-session state. Lifecycle begins on accept, ends on close; never
/// shared across sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Opaque unique session id.
    pub id: SessionId,
    /// Remote endpoint.
    pub peer: SocketAddr,
    /// Registration instant.
    pub registered_at: DateTime<Utc>,
    /// Device id latched from the first decoded frame.
    pub device_id: Option<String>,
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatsSnapshot {
    /// Active TCP session count.
    pub active_sessions: usize,
    /// Whether the UDP endpoint is running.
    pub udp_active: bool,
    /// Total messages received over the gateway lifetime (monotonic).
    pub total_messages: u64,
    /// Lifetime messages per second.
    pub messages_per_second: f64,
    /// Seconds since the tracker was created.
    pub uptime_seconds: u64,
}

/// Shared registry of live TCP sessions plus ingress counters.
pub struct SessionTracker {
    sessions: RwLock<HashMap<u64, SessionInfo>>,
    next_id: AtomicU64,
    udp_active: AtomicBool,
    messages_received: AtomicU64,
    started: Instant,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            udp_active: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Allocates a fresh session id.
    pub fn allocate(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a session on accept.
    pub fn register(&self, id: SessionId, peer: SocketAddr) {
        debug!(%id, %peer, "Session registered");
        lock_write!(self.sessions).insert(
            id.0,
            SessionInfo {
                id,
                peer,
                registered_at: Utc::now(),
                device_id: None,
            },
        );
    }

    /// Latches the device id inferred from the session's first frame.
    /// Later calls for the same session are ignored.
    pub fn latch_device_id(&self, id: SessionId, device_id: &str) {
        let mut sessions = lock_write!(self.sessions);
        if let Some(info) = sessions.get_mut(&id.0) {
            if info.device_id.is_none() {
                info.device_id = Some(device_id.to_string());
            }
        }
    }

    /// Device id latched for a session, if any.
    pub fn device_id(&self, id: SessionId) -> Option<String> {
        lock_read!(self.sessions)
            .get(&id.0)
            .and_then(|info| info.device_id.clone())
    }

    /// Removes a session on teardown.
    pub fn unregister(&self, id: SessionId) {
        debug!(%id, "Session unregistered");
        lock_write!(self.sessions).remove(&id.0);
    }

    /// Number of live TCP sessions.
    pub fn active_sessions(&self) -> usize {
        lock_read!(self.sessions).len()
    }

    /// Marks the UDP endpoint running or stopped.
    pub fn set_udp_active(&self, active: bool) {
        self.udp_active.store(active, Ordering::Relaxed);
    }

    /// Counts one received message.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages received so far.
    pub fn total_messages(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Recomputes the statistics snapshot from the live counters.
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        let total_messages = self.messages_received.load(Ordering::Relaxed);
        let uptime = self.started.elapsed();
        let uptime_seconds = uptime.as_secs();
        let messages_per_second = if uptime.as_secs_f64() > 0.0 {
            total_messages as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        ConnectionStatsSnapshot {
            active_sessions: self.active_sessions(),
            udp_active: self.udp_active.load(Ordering::Relaxed),
            total_messages,
            messages_per_second,
            uptime_seconds,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.5:40000".parse().expect("addr")
    }

    #[test]
    fn test_allocate_unique_ids() {
        let tracker = SessionTracker::new();
        let a = tracker.allocate();
        let b = tracker.allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_unregister_counts() {
        let tracker = SessionTracker::new();
        let id = tracker.allocate();
        tracker.register(id, peer());
        assert_eq!(tracker.active_sessions(), 1);
        tracker.unregister(id);
        assert_eq!(tracker.active_sessions(), 0);
    }

    #[test]
    fn test_device_id_latches_once() {
        let tracker = SessionTracker::new();
        let id = tracker.allocate();
        tracker.register(id, peer());

        tracker.latch_device_id(id, "GPRMC");
        tracker.latch_device_id(id, "GPGGA");
        assert_eq!(tracker.device_id(id).as_deref(), Some("GPRMC"));
    }

    #[test]
    fn test_snapshot_counters() {
        let tracker = SessionTracker::new();
        tracker.set_udp_active(true);
        for _ in 0..5 {
            tracker.record_message();
        }

        let snapshot = tracker.snapshot();
        assert!(snapshot.udp_active);
        assert_eq!(snapshot.total_messages, 5);
        assert_eq!(snapshot.active_sessions, 0);
        assert!(snapshot.messages_per_second >= 0.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let tracker = SessionTracker::new();
        let json = serde_json::to_value(tracker.snapshot()).expect("serialize");
        assert!(json.get("activeSessions").is_some());
        assert!(json.get("udpActive").is_some());
        assert!(json.get("totalMessages").is_some());
        assert!(json.get("messagesPerSecond").is_some());
        assert!(json.get("uptimeSeconds").is_some());
    }
}
