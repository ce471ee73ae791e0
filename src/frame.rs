//! Raw frames as delivered by the connection layer.
//!
//! A [`RawFrame`] is the immutable triple of payload bytes, arrival
//! timestamp, and source descriptor, plus the device id the connection layer
//! resolved for it. The payload stays in its pooled buffer; dropping the
//! frame returns the buffer to the pool.

use crate::buffer_pool::PooledBuf;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;

/// Unique identifier for a TCP session, stable for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Where a frame came from.
#[derive(Debug, Clone)]
pub enum FrameSource {
    /// A long-lived TCP session.
    Tcp {
        /// Session that read the frame.
        session_id: SessionId,
        /// Remote endpoint of the session.
        peer: SocketAddr,
    },
    /// A single UDP datagram; the endpoint is stateless.
    Udp {
        /// Datagram sender.
        peer: SocketAddr,
    },
}

impl FrameSource {
    /// Remote address of the sender.
    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Tcp { peer, .. } | Self::Udp { peer } => *peer,
        }
    }
}

/// One opaque byte buffer plus arrival metadata.
///
/// Ownership of the pooled payload transfers with the frame: the reader owns
/// it until enqueue, the pipeline until publish completes.
#[derive(Debug)]
pub struct RawFrame {
    /// Pooled payload bytes.
    pub payload: PooledBuf,
    /// Wall-clock UTC arrival instant.
    pub received_at: DateTime<Utc>,
    /// Source descriptor.
    pub source: FrameSource,
    /// Device id resolved by the connection layer (latched session tag for
    /// TCP, synthetic peer-derived id for UDP).
    pub device_id: String,
}

impl RawFrame {
    /// Builds a frame stamped with the current wall clock.
    pub fn new(payload: PooledBuf, source: FrameSource, device_id: impl Into<String>) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
            source,
            device_id: device_id.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.as_slice().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.as_slice().is_empty()
    }
}

/// Infers a device tag from a payload with a leading `$XX...,` pattern: the
/// five bytes after `$` (talker plus sentence type, e.g. `GPRMC`).
///
/// This is the source contract, not a real device identity — many devices
/// emit the same talker+type. Returns `None` when the payload does not start
/// with a well-formed tag.
pub fn infer_device_tag(payload: &[u8]) -> Option<String> {
    let mut rest = payload;
    while let [first, tail @ ..] = rest {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }
    if rest.first() != Some(&b'$') {
        return None;
    }
    let tag = rest.get(1..6)?;
    if tag.iter().all(|b| b.is_ascii_alphanumeric()) {
        Some(String::from_utf8_lossy(tag).into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_device_tag() {
        assert_eq!(
            infer_device_tag(b"$GPRMC,123519,A").as_deref(),
            Some("GPRMC")
        );
        assert_eq!(
            infer_device_tag(b"\r\n$GPGGA,123519").as_deref(),
            Some("GPGGA")
        );
        assert_eq!(infer_device_tag(b"GPRMC,123519"), None);
        assert_eq!(infer_device_tag(b"$GP"), None);
        assert_eq!(infer_device_tag(b"$GP,MC,1"), None);
        assert_eq!(infer_device_tag(b""), None);
    }
}
