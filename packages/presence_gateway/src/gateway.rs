//! Gateway reactor
//!
//! One task owns the multiplexer and the presence bridge. Transport tasks,
//! upstream pumps and reconnect timers never touch that state; they post a
//! [`GatewayEvent`] and the reactor applies events one at a time, in arrival
//! order. Handlers therefore never run concurrently and need no locking.

use channel_mux::{ChannelRegistry, ConnectionId, MuxError, Multiplexer, Outbound};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bridge::{PresenceBridge, register_presence_channel};
use crate::connector::{StreamDriver, StreamEvent, StreamKey};
use crate::driver::TokioDriver;
use crate::upstream::PresenceClient;

/// Everything the reactor reacts to.
#[derive(Debug)]
pub enum GatewayEvent {
    Connected {
        id: ConnectionId,
        outbound: Outbound,
    },
    Frame {
        id: ConnectionId,
        text: String,
    },
    TransportError {
        id: ConnectionId,
        error: String,
    },
    Closed {
        id: ConnectionId,
    },
    Upstream {
        key: StreamKey,
        event: StreamEvent,
    },
    Reconnect(StreamKey),
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

pub struct Gateway<D: StreamDriver> {
    mux: Multiplexer<PresenceBridge<D>>,
    bridge: PresenceBridge<D>,
}

impl<D: StreamDriver + 'static> Gateway<D> {
    pub fn new(driver: D, reconnect_delay: Duration) -> Self {
        let mut registry = ChannelRegistry::new();
        register_presence_channel(&mut registry);
        Self {
            mux: Multiplexer::new(registry),
            bridge: PresenceBridge::new(driver, reconnect_delay),
        }
    }

    #[cfg(test)]
    pub fn bridge(&self) -> &PresenceBridge<D> {
        &self.bridge
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.mux.connection_count()
    }

    /// Apply one event. Breaks once the gateway has shut down.
    pub fn handle_event(&mut self, event: GatewayEvent) -> ControlFlow<()> {
        match event {
            GatewayEvent::Connected { id, outbound } => {
                self.mux.register(&mut self.bridge, id, outbound);
            }
            GatewayEvent::Frame { id, text } => {
                if let Err(e) = self.mux.dispatch_inbound(&mut self.bridge, id, &text) {
                    log_dropped_frame(id, &e);
                }
            }
            GatewayEvent::TransportError { id, error } => {
                self.mux.on_transport_error(&mut self.bridge, id, &error);
            }
            GatewayEvent::Closed { id } => {
                self.mux.on_transport_close(&mut self.bridge, id);
            }
            GatewayEvent::Upstream { key, event } => {
                self.bridge.on_stream_event(&key, event);
            }
            GatewayEvent::Reconnect(key) => {
                self.bridge.on_reconnect(&key);
            }
            GatewayEvent::Shutdown { respond_to } => {
                info!(
                    connections = self.mux.connection_count(),
                    sessions = self.bridge.session_count(),
                    "Stopping gateway"
                );
                self.mux.shutdown(&mut self.bridge);
                self.bridge.shutdown();
                info!("Gateway stopped");
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Drain `events` until shutdown or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                return;
            }
        }
        debug!("Gateway event queue closed");
    }
}

fn log_dropped_frame(id: ConnectionId, err: &MuxError) {
    match err {
        MuxError::MalformedFrame(_) => warn!(conn_id = %id, error = %err, "Dropping frame"),
        _ => debug!(conn_id = %id, error = %err, "Dropping frame"),
    }
}

/// Cloneable entry point for transport tasks.
#[derive(Clone)]
pub struct GatewayHandle {
    sender: mpsc::UnboundedSender<GatewayEvent>,
    next_id: Arc<AtomicU64>,
}

impl GatewayHandle {
    pub fn new(sender: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new physical connection and return its id.
    pub fn connect(&self, outbound: Outbound) -> Result<ConnectionId, MuxError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.post(GatewayEvent::Connected { id, outbound })?;
        Ok(id)
    }

    pub fn frame(&self, id: ConnectionId, text: String) -> Result<(), MuxError> {
        self.post(GatewayEvent::Frame { id, text })
    }

    pub fn error(&self, id: ConnectionId, error: String) -> Result<(), MuxError> {
        self.post(GatewayEvent::TransportError { id, error })
    }

    pub fn close(&self, id: ConnectionId) -> Result<(), MuxError> {
        self.post(GatewayEvent::Closed { id })
    }

    /// Close every connection and cancel every upstream stream. Resolves
    /// once the reactor has finished, or immediately if it already has.
    pub async fn shutdown(&self) {
        let (respond_to, done) = oneshot::channel();
        if self.post(GatewayEvent::Shutdown { respond_to }).is_ok() {
            let _ = done.await;
        }
    }

    fn post(&self, event: GatewayEvent) -> Result<(), MuxError> {
        self.sender.send(event).map_err(|_| MuxError::ShutDown)
    }
}

/// Start the reactor on the current runtime with a tokio-backed driver.
pub fn spawn(client: Arc<dyn PresenceClient>, reconnect_delay: Duration) -> GatewayHandle {
    let (sender, events) = mpsc::unbounded_channel();
    let driver = TokioDriver::new(client, sender.clone());
    tokio::spawn(Gateway::new(driver, reconnect_delay).run(events));
    GatewayHandle::new(sender)
}
