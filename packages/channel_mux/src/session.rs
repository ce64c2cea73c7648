//! Channel sessions
//!
//! One session exists per (connection, channel) pair. It owns the handler
//! table for that conversation and knows how to frame outbound events.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::{EventName, OutboundFrame};
use crate::multiplexer::ConnectionId;

/// Outbound frame queue of one connection, drained by the transport.
pub type Outbound = mpsc::Sender<OutboundFrame>;

/// A handler invoked with the shared context, the session it fired on and the
/// event payload.
pub type Handler<C> = Box<dyn FnMut(&mut C, &SessionHandle, Option<Value>) + Send>;

/// Cheap, cloneable reference to a session's outbound side.
///
/// Listener callbacks hold one of these so they can write to the session
/// long after the handler that registered them has returned.
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    channel: Arc<str>,
    outbound: Outbound,
}

impl SessionHandle {
    pub fn new(connection_id: ConnectionId, channel: Arc<str>, outbound: Outbound) -> Self {
        Self {
            connection_id,
            channel,
            outbound,
        }
    }

    /// Identity of the owning connection.
    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Queue `{channel, event, data?}` for the client.
    ///
    /// Write failures belong to the transport: a full or closed queue is
    /// logged and the frame is dropped.
    pub fn send(&self, event: &str, data: Option<Value>) {
        let frame = OutboundFrame {
            channel: self.channel.to_string(),
            event: event.to_string(),
            data,
        };
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    conn_id = %self.connection_id,
                    channel = %self.channel,
                    event = %frame.event,
                    "Outbound queue full, dropping frame"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %self.connection_id, "Outbound queue closed");
            }
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.connection_id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// A channel's conversation with one connection.
pub struct ChannelSession<C> {
    handle: SessionHandle,
    handlers: HashMap<EventName, Handler<C>>,
}

impl<C> ChannelSession<C> {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            handlers: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn channel(&self) -> &str {
        self.handle.channel()
    }

    /// Register the handler for `event`, replacing any earlier one.
    pub fn on<F>(&mut self, event: impl Into<EventName>, handler: F) -> &mut Self
    where
        F: FnMut(&mut C, &SessionHandle, Option<Value>) + Send + 'static,
    {
        self.handlers.insert(event.into(), Box::new(handler));
        self
    }

    pub fn send(&self, event: &str, data: Option<Value>) -> &Self {
        self.handle.send(event, data);
        self
    }

    /// Run the handler for `event`, if any. Events nobody registered for are
    /// dropped silently.
    pub fn dispatch(&mut self, ctx: &mut C, event: &EventName, data: Option<Value>) {
        if let Some(handler) = self.handlers.get_mut(event) {
            handler(ctx, &self.handle, data);
        }
    }
}
