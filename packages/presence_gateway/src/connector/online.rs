use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{EntryEpoch, StreamDriver, StreamEvent, StreamKey, StreamKind, UpstreamCall};

/// A user connected on this node, holding their presence vote upstream.
#[derive(Debug)]
struct OnlineUser {
    epoch: EntryEpoch,
    /// Local sessions identified as this user
    on_this_node: usize,
    call: UpstreamCall,
}

/// Presence votes for locally connected users, one stream per user.
#[derive(Debug)]
pub struct OnlineUsers {
    users: HashMap<String, OnlineUser>,
    next_epoch: u64,
    reconnect_delay: Duration,
}

impl OnlineUsers {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            users: HashMap::new(),
            next_epoch: 1,
            reconnect_delay,
        }
    }

    /// One more local session is `username`. The first opens the vote.
    pub fn acquire(&mut self, username: &str, driver: &mut impl StreamDriver) {
        if let Some(user) = self.users.get_mut(username) {
            user.on_this_node += 1;
            debug!(user = %username, on_this_node = user.on_this_node, "Presence acquired");
            return;
        }

        let epoch = EntryEpoch(self.next_epoch);
        self.next_epoch += 1;
        let call = UpstreamCall::open(StreamKind::Connect, username, epoch, driver);
        self.users.insert(
            username.to_string(),
            OnlineUser {
                epoch,
                on_this_node: 1,
                call,
            },
        );
        info!(user = %username, "User online on this node");
    }

    /// One local session stopped being `username`. The last cancels the vote
    /// and forgets the user.
    pub fn release(&mut self, username: &str) {
        let Some(user) = self.users.get_mut(username) else {
            warn!(user = %username, "Release for user not online on this node");
            return;
        };

        if user.on_this_node > 1 {
            user.on_this_node -= 1;
            debug!(user = %username, on_this_node = user.on_this_node, "Presence released");
            return;
        }

        if let Some(user) = self.users.remove(username) {
            user.call.cancel();
            info!(user = %username, "User offline on this node");
        }
    }

    /// An event from one of this registry's streams.
    ///
    /// The vote stream carries no data; ending or failing while the user is
    /// still connected arms a reconnect.
    pub fn on_stream_event(
        &mut self,
        key: &StreamKey,
        event: StreamEvent,
        driver: &mut impl StreamDriver,
    ) {
        let delay = self.reconnect_delay;
        let Some(user) = self.current_entry(key) else {
            debug!(stream = %key, "Ignoring event from stale presence stream");
            return;
        };

        match event {
            StreamEvent::Data(_) => {}
            StreamEvent::End => {
                warn!(stream = %key, "Presence stream ended, reconnecting");
                user.call.terminated(delay, driver);
            }
            StreamEvent::Error(error) => {
                warn!(stream = %key, error = %error, "Presence stream failed, reconnecting");
                user.call.terminated(delay, driver);
            }
        }
    }

    /// A reconnect timer fired. Reopens only if the user is still connected
    /// here and the timer belongs to their current stream.
    pub fn reconnect(&mut self, key: &StreamKey, driver: &mut impl StreamDriver) {
        match self.users.get_mut(&key.subject) {
            Some(user) if user.epoch == key.epoch && user.on_this_node > 0 => {
                if user.call.reconnect(key, driver) {
                    info!(user = %key.subject, "Presence stream reconnected");
                }
            }
            _ => debug!(stream = %key, "Dropping reconnect for released user"),
        }
    }

    /// Cancel every vote and forget every user.
    pub fn shutdown(&mut self) {
        for (_, user) in self.users.drain() {
            user.call.cancel();
        }
    }

    #[cfg(test)]
    pub fn interest(&self, username: &str) -> usize {
        self.users.get(username).map(|u| u.on_this_node).unwrap_or(0)
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

    fn current_entry(&mut self, key: &StreamKey) -> Option<&mut OnlineUser> {
        self.users
            .get_mut(&key.subject)
            .filter(|u| u.epoch == key.epoch && u.call.is_current(key))
    }
}
