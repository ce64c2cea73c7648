//! Presence channel
//!
//! Wires the `presence` channel's events to the two connector registries.
//! Each session starts anonymous, becomes identified with `connectas`, and
//! may watch any number of users with `monitor` / `unmonitor`. Status
//! changes for a watched user arrive on the session as an `online` or
//! `offline` event whose data is the watched user's name.

use channel_mux::{ChannelRegistry, ConnectionId, SessionHandle};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connector::{MonitoredUsers, OnlineUsers, StreamDriver, StreamEvent, StreamKey, StreamKind};
use crate::upstream::PresenceStatus;

pub const PRESENCE_CHANNEL: &str = "presence";

/// Who a presence session claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Identified(String),
}

/// Per-session presence state.
#[derive(Debug)]
struct PresenceSession {
    identity: Identity,
    monitoring: BTreeSet<String>,
}

/// Process-wide presence state: both registries, every live session, and
/// the driver that turns registry decisions into upstream calls.
pub struct PresenceBridge<D> {
    online: OnlineUsers,
    monitored: MonitoredUsers,
    sessions: HashMap<ConnectionId, PresenceSession>,
    driver: D,
}

impl<D: StreamDriver> PresenceBridge<D> {
    pub fn new(driver: D, reconnect_delay: Duration) -> Self {
        Self {
            online: OnlineUsers::new(reconnect_delay),
            monitored: MonitoredUsers::new(reconnect_delay),
            sessions: HashMap::new(),
            driver,
        }
    }

    #[cfg(test)]
    pub fn online(&self) -> &OnlineUsers {
        &self.online
    }

    #[cfg(test)]
    pub fn monitored(&self) -> &MonitoredUsers {
        &self.monitored
    }

    #[cfg(test)]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[cfg(test)]
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    #[cfg(test)]
    pub fn identity(&self, id: ConnectionId) -> Option<&Identity> {
        self.sessions.get(&id).map(|s| &s.identity)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open_session(&mut self, id: ConnectionId) {
        debug!(conn_id = %id, "Received new connection");
        self.sessions.insert(
            id,
            PresenceSession {
                identity: Identity::Anonymous,
                monitoring: BTreeSet::new(),
            },
        );
    }

    /// Claim `username` for the session, releasing any earlier claim first.
    pub fn connect_as(&mut self, id: ConnectionId, username: &str) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        debug!(conn_id = %id, "Connecting as {}", username);

        let previous = std::mem::replace(
            &mut session.identity,
            Identity::Identified(username.to_string()),
        );
        if let Identity::Identified(old) = previous {
            debug!(conn_id = %id, "Disconnecting {} first", old);
            self.online.release(&old);
        }
        self.online.acquire(username, &mut self.driver);
    }

    /// Watch `username` on behalf of the session behind `handle`.
    pub fn monitor(&mut self, handle: &SessionHandle, username: &str) {
        let id = handle.id();
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        debug!(conn_id = %id, "{} is monitoring {}", describe(&session.identity), username);

        session.monitoring.insert(username.to_string());
        let reply = handle.clone();
        let watched = username.to_string();
        self.monitored.monitor(
            username,
            id,
            Box::new(move |status: PresenceStatus| {
                reply.send(status.as_str(), Some(Value::String(watched.clone())));
            }),
            &mut self.driver,
        );
    }

    pub fn unmonitor(&mut self, id: ConnectionId, username: &str) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        debug!(conn_id = %id, "{} is unmonitoring {}", describe(&session.identity), username);

        session.monitoring.remove(username);
        self.monitored.unmonitor(username, id);
    }

    /// The session ended. Releases its identity and every watch exactly
    /// once; later calls for the same session do nothing.
    pub fn terminate(&mut self, id: ConnectionId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };

        if let Identity::Identified(username) = &session.identity {
            debug!(conn_id = %id, "{} disconnected", username);
            self.online.release(username);
        }
        for username in &session.monitoring {
            self.monitored.unmonitor(username, id);
        }
    }

    pub fn on_stream_event(&mut self, key: &StreamKey, event: StreamEvent) {
        match key.kind {
            StreamKind::Connect => self.online.on_stream_event(key, event, &mut self.driver),
            StreamKind::Monitor => self.monitored.on_stream_event(key, event, &mut self.driver),
        }
    }

    pub fn on_reconnect(&mut self, key: &StreamKey) {
        match key.kind {
            StreamKind::Connect => self.online.reconnect(key, &mut self.driver),
            StreamKind::Monitor => self.monitored.reconnect(key, &mut self.driver),
        }
    }

    /// Cancel every upstream stream still open.
    pub fn shutdown(&mut self) {
        if !self.online.is_empty() || !self.monitored.is_empty() {
            info!(
                online = self.online.len(),
                monitored = self.monitored.len(),
                "Cancelling upstream streams"
            );
        }
        self.sessions.clear();
        self.online.shutdown();
        self.monitored.shutdown();
    }
}

fn describe(identity: &Identity) -> &str {
    match identity {
        Identity::Anonymous => "anonymous",
        Identity::Identified(name) => name,
    }
}

/// Usernames arrive as the frame's `data`; anything but a string is dropped.
fn username(event: &str, handle: &SessionHandle, data: Option<Value>) -> Option<String> {
    match data {
        Some(Value::String(name)) => Some(name),
        other => {
            warn!(conn_id = %handle.id(), event, data = ?other, "Expected a username");
            None
        }
    }
}

/// Declare the `presence` channel on `registry`.
pub fn register_presence_channel<D>(registry: &mut ChannelRegistry<PresenceBridge<D>>)
where
    D: StreamDriver + 'static,
{
    registry.of(PRESENCE_CHANNEL, |session, bridge: &mut PresenceBridge<D>| {
        bridge.open_session(session.id());

        session
            .on("connectas", |bridge: &mut PresenceBridge<D>, s, data| {
                if let Some(user) = username("connectas", s, data) {
                    bridge.connect_as(s.id(), &user);
                }
            })
            .on("monitor", |bridge: &mut PresenceBridge<D>, s, data| {
                if let Some(user) = username("monitor", s, data) {
                    bridge.monitor(s, &user);
                }
            })
            .on("unmonitor", |bridge: &mut PresenceBridge<D>, s, data| {
                if let Some(user) = username("unmonitor", s, data) {
                    bridge.unmonitor(s.id(), &user);
                }
            })
            .on("close", |bridge: &mut PresenceBridge<D>, s, _data| {
                bridge.terminate(s.id());
            })
            .on("error", |bridge: &mut PresenceBridge<D>, s, _data| {
                bridge.terminate(s.id());
            });
    });
}
