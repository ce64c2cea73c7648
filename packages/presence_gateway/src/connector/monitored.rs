use channel_mux::ConnectionId;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{EntryEpoch, StreamDriver, StreamEvent, StreamKey, StreamKind, UpstreamCall};
use crate::upstream::PresenceStatus;

/// Callback receiving a watched user's status.
pub type Listener = Box<dyn Fn(PresenceStatus) + Send>;

/// A user watched from this node, with everyone watching them locally.
struct MonitoredUser {
    epoch: EntryEpoch,
    /// Last status received upstream; `None` until the first one arrives
    status: Option<PresenceStatus>,
    /// Listeners in registration order
    monitoring: Vec<(ConnectionId, Listener)>,
    call: UpstreamCall,
}

impl MonitoredUser {
    fn notify_all(&self, status: PresenceStatus) {
        for (_, listener) in &self.monitoring {
            listener(status);
        }
    }
}

/// Status subscriptions for watched users, one stream per watched user
/// shared by all of its local listeners.
pub struct MonitoredUsers {
    users: HashMap<String, MonitoredUser>,
    next_epoch: u64,
    reconnect_delay: Duration,
}

impl MonitoredUsers {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            users: HashMap::new(),
            next_epoch: 1,
            reconnect_delay,
        }
    }

    /// Register `listener` for `username` under `key`, replacing any listener
    /// `key` already had. A joiner on an existing entry is told the last known
    /// status straight away.
    pub fn monitor(
        &mut self,
        username: &str,
        key: ConnectionId,
        listener: Listener,
        driver: &mut impl StreamDriver,
    ) {
        if let Some(user) = self.users.get_mut(username) {
            let status = user.status;
            match user.monitoring.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = listener,
                None => user.monitoring.push((key, listener)),
            }
            debug!(
                user = %username,
                listeners = user.monitoring.len(),
                "Listener joined monitored user"
            );
            if let Some(status) = status {
                if let Some((_, listener)) = user.monitoring.iter().find(|(k, _)| *k == key) {
                    listener(status);
                }
            }
            return;
        }

        let epoch = EntryEpoch(self.next_epoch);
        self.next_epoch += 1;
        let call = UpstreamCall::open(StreamKind::Monitor, username, epoch, driver);
        self.users.insert(
            username.to_string(),
            MonitoredUser {
                epoch,
                status: None,
                monitoring: vec![(key, listener)],
                call,
            },
        );
        info!(user = %username, "Started monitoring user");
    }

    /// Drop `key`'s listener for `username`. The last listener out cancels
    /// the stream and forgets the user.
    pub fn unmonitor(&mut self, username: &str, key: ConnectionId) {
        let Some(user) = self.users.get_mut(username) else {
            debug!(user = %username, "Unmonitor for user not monitored");
            return;
        };

        user.monitoring.retain(|(k, _)| *k != key);
        if !user.monitoring.is_empty() {
            return;
        }

        if let Some(user) = self.users.remove(username) {
            user.call.cancel();
            info!(user = %username, "Stopped monitoring user");
        }
    }

    /// An event from one of this registry's streams.
    ///
    /// Data is fanned out only when it differs from the last known status.
    /// End and error arm a reconnect.
    pub fn on_stream_event(
        &mut self,
        key: &StreamKey,
        event: StreamEvent,
        driver: &mut impl StreamDriver,
    ) {
        let delay = self.reconnect_delay;
        let Some(user) = self
            .users
            .get_mut(&key.subject)
            .filter(|u| u.epoch == key.epoch && u.call.is_current(key))
        else {
            debug!(stream = %key, "Ignoring event from stale monitor stream");
            return;
        };

        match event {
            StreamEvent::Data(status) => {
                if user.status == Some(status) {
                    return;
                }
                user.status = Some(status);
                debug!(
                    "{} went {} with {} clients listening",
                    key.subject,
                    status,
                    user.monitoring.len()
                );
                user.notify_all(status);
            }
            StreamEvent::End => {
                warn!(stream = %key, "Monitor stream ended, reconnecting");
                user.call.terminated(delay, driver);
            }
            StreamEvent::Error(error) => {
                warn!(stream = %key, error = %error, "Monitor stream failed, reconnecting");
                user.call.terminated(delay, driver);
            }
        }
    }

    /// A reconnect timer fired. Reopens only if the user is still watched
    /// and the timer belongs to their current stream.
    pub fn reconnect(&mut self, key: &StreamKey, driver: &mut impl StreamDriver) {
        match self.users.get_mut(&key.subject) {
            Some(user) if user.epoch == key.epoch => {
                if user.call.reconnect(key, driver) {
                    info!(user = %key.subject, "Monitor stream reconnected");
                }
            }
            _ => debug!(stream = %key, "Dropping reconnect for unmonitored user"),
        }
    }

    /// Cancel every subscription and forget every user.
    pub fn shutdown(&mut self) {
        for (_, user) in self.users.drain() {
            user.call.cancel();
        }
    }

    #[cfg(test)]
    pub fn status(&self, username: &str) -> Option<PresenceStatus> {
        self.users.get(username).and_then(|u| u.status)
    }

    #[cfg(test)]
    pub fn listener_count(&self, username: &str) -> usize {
        self.users
            .get(username)
            .map(|u| u.monitoring.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
