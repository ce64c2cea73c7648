//! Upstream presence service
//!
//! The gateway only ever opens two kinds of streaming call against the
//! presence service: `connect`, which holds the user's vote for as long as the
//! call stays open, and `monitor`, which reports the user's online flag every
//! time it changes. Both end with exactly one terminal item: stream end or an
//! error.

mod vote;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use vote::VoteBackend;

/// Payload of a `monitor` stream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub online: bool,
}

/// A user's presence as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl From<PresenceUpdate> for PresenceStatus {
    fn from(update: PresenceUpdate) -> Self {
        if update.online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an upstream stream. Always transient from the
/// gateway's point of view.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("presence service unavailable: {0}")]
    Unavailable(String),
}

pub type UpstreamStream = BoxStream<'static, Result<PresenceUpdate, UpstreamError>>;

/// Client side of the presence service.
///
/// Opening a call never fails synchronously; connection problems surface as
/// the first item of the returned stream. Dropping the stream cancels the
/// call.
pub trait PresenceClient: Send + Sync + 'static {
    /// Hold `name` online for as long as the returned stream is alive.
    fn connect(&self, name: &str) -> UpstreamStream;

    /// Watch `name`: one item with the current flag, then one per change.
    fn monitor(&self, name: &str) -> UpstreamStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_update() {
        assert_eq!(
            PresenceStatus::from(PresenceUpdate { online: true }),
            PresenceStatus::Online
        );
        assert_eq!(
            PresenceStatus::from(PresenceUpdate { online: false }),
            PresenceStatus::Offline
        );
    }

    #[test]
    fn test_status_event_names() {
        assert_eq!(PresenceStatus::Online.to_string(), "online");
        assert_eq!(PresenceStatus::Offline.as_str(), "offline");
    }

    #[test]
    fn test_update_wire_format() {
        let update: PresenceUpdate = serde_json::from_str(r#"{"online":true}"#).unwrap();
        assert!(update.online);
    }
}
