//! Reference-counted upstream connectors
//!
//! Local interest in a subject is counted separately from the upstream stream
//! that serves it: however many local parties care about a subject, there is
//! at most one stream open for it. The stream is opened on the first unit of
//! interest, cancelled on the last, and reopened after a delay whenever it
//! ends or fails while someone still cares.
//!
//! Registries never touch the runtime directly. Opening streams and arming
//! reconnect timers go through a [`StreamDriver`], and the resulting stream
//! events and timer firings come back in as plain method calls, each tagged
//! with the [`StreamKey`] they were issued for. Keys carry the entry's epoch
//! and the stream's generation, so anything that arrives for an entry that
//! has since been destroyed, or for a stream that has since been replaced,
//! is recognised as stale and ignored.

mod monitored;
mod online;

use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::upstream::{PresenceStatus, UpstreamError};

pub use monitored::MonitoredUsers;
pub use online::OnlineUsers;

/// Delay before reopening a stream that ended or failed.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Which upstream call a stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Presence vote for a locally connected user
    Connect,
    /// Status subscription for a watched user
    Monitor,
}

/// Identity of one registry entry over its whole lifetime. A subject that is
/// released and later acquired again gets a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryEpoch(pub u64);

/// Address of one concrete upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub subject: String,
    pub epoch: EntryEpoch,
    /// Bumped every time the entry reopens its stream
    pub generation: u64,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StreamKind::Connect => "connect",
            StreamKind::Monitor => "monitor",
        };
        write!(
            f,
            "{}:{}#{}.{}",
            kind, self.subject, self.epoch.0, self.generation
        )
    }
}

/// What an upstream stream produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(PresenceStatus),
    End,
    Error(String),
}

impl From<UpstreamError> for StreamEvent {
    fn from(err: UpstreamError) -> Self {
        StreamEvent::Error(err.to_string())
    }
}

/// Local handle on a live stream; cancelling requests termination.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Side effects a registry needs from the runtime.
pub trait StreamDriver {
    /// Open the upstream call described by `key` and start delivering its
    /// events back, tagged with `key`.
    fn open(&mut self, key: &StreamKey) -> StreamHandle;

    /// Deliver `key` back as a reconnect request after `delay`.
    fn schedule_reconnect(&mut self, key: &StreamKey, delay: Duration);
}

/// Stream bookkeeping shared by both registries: which stream is current,
/// and whether a reconnect is already armed for it.
#[derive(Debug)]
pub(crate) struct UpstreamCall {
    key: StreamKey,
    handle: StreamHandle,
    reconnect_pending: bool,
}

impl UpstreamCall {
    pub(crate) fn open(
        kind: StreamKind,
        subject: &str,
        epoch: EntryEpoch,
        driver: &mut impl StreamDriver,
    ) -> Self {
        let key = StreamKey {
            kind,
            subject: subject.to_string(),
            epoch,
            generation: 0,
        };
        let handle = driver.open(&key);
        debug!(stream = %key, "Upstream stream opened");
        Self {
            key,
            handle,
            reconnect_pending: false,
        }
    }

    /// True when `key` addresses this entry's current stream.
    pub(crate) fn is_current(&self, key: &StreamKey) -> bool {
        self.key == *key
    }

    /// The current stream ended or failed. Arms one reconnect; repeated
    /// terminal events for the same stream are ignored.
    pub(crate) fn terminated(&mut self, delay: Duration, driver: &mut impl StreamDriver) {
        if self.reconnect_pending {
            return;
        }
        self.reconnect_pending = true;
        driver.schedule_reconnect(&self.key, delay);
    }

    /// A reconnect timer fired for `key`. Reopens only if that timer belongs
    /// to the current stream and is still wanted.
    pub(crate) fn reconnect(&mut self, key: &StreamKey, driver: &mut impl StreamDriver) -> bool {
        if !self.reconnect_pending || !self.is_current(key) {
            return false;
        }
        self.handle.cancel();
        self.key.generation += 1;
        self.handle = driver.open(&self.key);
        self.reconnect_pending = false;
        debug!(stream = %self.key, "Upstream stream reopened");
        true
    }

    pub(crate) fn cancel(&self) {
        self.handle.cancel();
        debug!(stream = %self.key, "Upstream stream cancelled");
    }
}
