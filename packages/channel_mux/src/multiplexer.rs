//! Session Multiplexer
//!
//! Owns every live connection and its sessions. Inbound frames are routed by
//! channel name, then by event name. Transport close and error are fanned out
//! to every session of the connection as the `close` / `error` events, after
//! which the connection is gone and further frames for it are refused.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::channel::ChannelRegistry;
use crate::error::MuxError;
use crate::frame::{EventName, InboundFrame};
use crate::session::{ChannelSession, Outbound, SessionHandle};

/// Process-unique identity of a physical connection.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One physical connection and its sessions, in registry order.
struct Connection<C> {
    sessions: Vec<ChannelSession<C>>,
}

impl<C> Connection<C> {
    fn session_mut(&mut self, channel: &str) -> Option<&mut ChannelSession<C>> {
        self.sessions.iter_mut().find(|s| s.channel() == channel)
    }

    fn broadcast(&mut self, ctx: &mut C, event: &EventName, data: Option<Value>) {
        for session in &mut self.sessions {
            session.dispatch(ctx, event, data.clone());
        }
    }
}

/// Routes frames for all connections. `C` is the shared context handed to
/// every handler.
pub struct Multiplexer<C> {
    registry: ChannelRegistry<C>,
    connections: HashMap<ConnectionId, Connection<C>>,
    accepting: bool,
}

impl<C> Multiplexer<C> {
    pub fn new(registry: ChannelRegistry<C>) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            accepting: true,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Create one session per declared channel for a new connection.
    pub fn register(&mut self, ctx: &mut C, id: ConnectionId, outbound: Outbound) {
        if !self.accepting {
            warn!(conn_id = %id, "Rejecting connection during shutdown");
            return;
        }
        if self.connections.contains_key(&id) {
            warn!(conn_id = %id, "Connection already registered");
            return;
        }

        let mut sessions = Vec::with_capacity(self.registry.len());
        for channel in self.registry.iter() {
            let handle = SessionHandle::new(id, channel.shared_name(), outbound.clone());
            let mut session = ChannelSession::new(handle);
            channel.onboard(&mut session, ctx);
            sessions.push(session);
        }

        debug!(conn_id = %id, channels = sessions.len(), "Connection registered");
        self.connections.insert(id, Connection { sessions });
    }

    /// Route one raw client frame to the session it names.
    ///
    /// Errors describe why the frame was dropped; the connection stays usable.
    pub fn dispatch_inbound(
        &mut self,
        ctx: &mut C,
        id: ConnectionId,
        raw: &str,
    ) -> Result<(), MuxError> {
        if !self.accepting {
            return Err(MuxError::ShutDown);
        }
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(MuxError::UnknownConnection(id))?;

        let frame = InboundFrame::parse(raw)?;
        let channel = frame.channel.ok_or(MuxError::MissingChannel)?;
        let session = connection
            .session_mut(&channel)
            .ok_or_else(|| MuxError::UnknownChannel(channel.clone()))?;

        let (event, rejected) = EventName::from_client(frame.event.as_deref());
        if let Some(name) = rejected {
            warn!(conn_id = %id, channel = %channel, "Illegal event name [{}]", name);
        }

        session.dispatch(ctx, &event, frame.data);
        Ok(())
    }

    /// The transport closed: every session sees `close`, then the connection
    /// is dropped.
    pub fn on_transport_close(&mut self, ctx: &mut C, id: ConnectionId) {
        match self.connections.remove(&id) {
            Some(mut connection) => {
                debug!(conn_id = %id, "Connection closed");
                connection.broadcast(ctx, &EventName::Close, None);
            }
            None => debug!(conn_id = %id, "Close for unknown or already closed connection"),
        }
    }

    /// The transport failed: every session sees `error` with the error as
    /// payload, then the connection is dropped.
    pub fn on_transport_error(&mut self, ctx: &mut C, id: ConnectionId, error: &str) {
        match self.connections.remove(&id) {
            Some(mut connection) => {
                warn!(conn_id = %id, error = %error, "Connection error");
                connection.broadcast(ctx, &EventName::Error, Some(Value::String(error.to_string())));
            }
            None => debug!(conn_id = %id, "Error for unknown or already closed connection"),
        }
    }

    /// Stop accepting frames and close every connection.
    ///
    /// Each session sees `close` so its handlers release whatever they hold.
    pub fn shutdown(&mut self, ctx: &mut C) {
        if !self.accepting {
            return;
        }
        self.accepting = false;

        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        info!(connections = ids.len(), "Closing all connections");
        for id in ids {
            self.on_transport_close(ctx, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OutboundFrame;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Records every dispatched (connection, channel, event, data).
    #[derive(Default)]
    struct Log {
        events: Vec<(u64, String, String, Option<Value>)>,
        onboarded: Vec<(u64, String)>,
    }

    fn recording_channel(registry: &mut ChannelRegistry<Log>, name: &str) {
        registry.of(name, |session, log: &mut Log| {
            log.onboarded
                .push((session.id().0, session.channel().to_string()));
            for event in ["data", "close", "error", "monitor"] {
                session.on(event, move |log: &mut Log, s, data| {
                    log.events
                        .push((s.id().0, s.channel().to_string(), event.to_string(), data));
                });
            }
        });
    }

    fn mux() -> Multiplexer<Log> {
        let mut registry = ChannelRegistry::new();
        recording_channel(&mut registry, "presence");
        recording_channel(&mut registry, "chat");
        Multiplexer::new(registry)
    }

    fn outbound() -> (Outbound, mpsc::Receiver<OutboundFrame>) {
        mpsc::channel(16)
    }

    #[test]
    fn test_register_onboards_every_channel_in_order() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        assert_eq!(
            log.onboarded,
            vec![(1, "presence".to_string()), (1, "chat".to_string())]
        );
        assert!(mux.is_connected(ConnectionId(1)));
    }

    #[test]
    fn test_frame_routes_to_named_channel_only() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        mux.dispatch_inbound(
            &mut log,
            ConnectionId(1),
            r#"{"channel":"chat","event":"monitor","data":"alice"}"#,
        )
        .unwrap();

        assert_eq!(
            log.events,
            vec![(1, "chat".to_string(), "monitor".to_string(), Some(json!("alice")))]
        );
    }

    #[test]
    fn test_missing_event_dispatches_as_data() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        mux.dispatch_inbound(&mut log, ConnectionId(1), r#"{"channel":"presence"}"#)
            .unwrap();

        assert_eq!(
            log.events,
            vec![(1, "presence".to_string(), "data".to_string(), None)]
        );
    }

    #[test]
    fn test_client_close_event_is_remapped_to_data() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        mux.dispatch_inbound(
            &mut log,
            ConnectionId(1),
            r#"{"channel":"presence","event":"close"}"#,
        )
        .unwrap();
        mux.dispatch_inbound(
            &mut log,
            ConnectionId(1),
            r#"{"channel":"presence","event":"error","data":"spoof"}"#,
        )
        .unwrap();

        let events: Vec<_> = log.events.iter().map(|e| e.2.as_str()).collect();
        assert_eq!(events, vec!["data", "data"]);
        assert!(mux.is_connected(ConnectionId(1)));
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        let err = mux
            .dispatch_inbound(&mut log, ConnectionId(1), "{not json")
            .unwrap_err();
        assert!(matches!(err, MuxError::MalformedFrame(_)));
        assert!(log.events.is_empty());
        assert!(mux.is_connected(ConnectionId(1)));
    }

    #[test]
    fn test_missing_and_unknown_channel_are_dropped() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        let err = mux
            .dispatch_inbound(&mut log, ConnectionId(1), r#"{"event":"monitor"}"#)
            .unwrap_err();
        assert!(matches!(err, MuxError::MissingChannel));

        let err = mux
            .dispatch_inbound(&mut log, ConnectionId(1), r#"{"channel":"friends"}"#)
            .unwrap_err();
        assert!(matches!(err, MuxError::UnknownChannel(ref name) if name == "friends"));
        assert!(log.events.is_empty());
    }

    #[test]
    fn test_connections_do_not_cross_talk() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        mux.register(&mut log, ConnectionId(1), tx1);
        mux.register(&mut log, ConnectionId(2), tx2);

        mux.dispatch_inbound(
            &mut log,
            ConnectionId(2),
            r#"{"channel":"presence","event":"monitor","data":"bob"}"#,
        )
        .unwrap();

        assert_eq!(log.events.len(), 1);
        assert_eq!(log.events[0].0, 2);
    }

    #[test]
    fn test_close_broadcasts_to_every_session_in_order() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        mux.on_transport_close(&mut log, ConnectionId(1));

        assert_eq!(
            log.events,
            vec![
                (1, "presence".to_string(), "close".to_string(), None),
                (1, "chat".to_string(), "close".to_string(), None),
            ]
        );
        assert!(!mux.is_connected(ConnectionId(1)));
    }

    #[test]
    fn test_error_broadcasts_payload_and_terminates() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx, _rx) = outbound();
        mux.register(&mut log, ConnectionId(1), tx);

        mux.on_transport_error(&mut log, ConnectionId(1), "connection reset");
        mux.on_transport_close(&mut log, ConnectionId(1));

        assert_eq!(
            log.events,
            vec![
                (1, "presence".to_string(), "error".to_string(), Some(json!("connection reset"))),
                (1, "chat".to_string(), "error".to_string(), Some(json!("connection reset"))),
            ]
        );

        let err = mux
            .dispatch_inbound(&mut log, ConnectionId(1), r#"{"channel":"presence"}"#)
            .unwrap_err();
        assert!(matches!(err, MuxError::UnknownConnection(ConnectionId(1))));
    }

    #[test]
    fn test_shutdown_closes_connections_and_rejects_frames() {
        let mut mux = mux();
        let mut log = Log::default();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        mux.register(&mut log, ConnectionId(1), tx1);
        mux.register(&mut log, ConnectionId(2), tx2);

        mux.shutdown(&mut log);

        assert_eq!(mux.connection_count(), 0);
        let closes = log.events.iter().filter(|e| e.2 == "close").count();
        assert_eq!(closes, 4);

        let err = mux
            .dispatch_inbound(&mut log, ConnectionId(1), r#"{"channel":"presence"}"#)
            .unwrap_err();
        assert!(matches!(err, MuxError::ShutDown));

        let (tx3, _rx3) = outbound();
        mux.register(&mut log, ConnectionId(3), tx3);
        assert!(!mux.is_connected(ConnectionId(3)));
    }
}
