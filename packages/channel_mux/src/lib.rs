//! Channel Mux - named event channels over one client connection
//!
//! A client holds a single bidirectional connection and talks to any number of
//! logical channels over it. Every frame names its channel; the multiplexer
//! routes it to that connection's session for the channel, and the session
//! routes it to the handler registered for the frame's event name.
//!
//! This crate knows nothing about the transport. Outbound frames are pushed
//! into a bounded queue that the transport drains; inbound frames are handed
//! to [`Multiplexer::dispatch_inbound`] as raw text.
//!
//! # Example
//!
//! ```
//! use channel_mux::{ChannelRegistry, ConnectionId, Multiplexer};
//! use serde_json::json;
//!
//! #[derive(Default)]
//! struct Counter {
//!     pings: usize,
//! }
//!
//! let mut registry = ChannelRegistry::new();
//! registry.of("ping", |session, _ctx: &mut Counter| {
//!     session.on("ping", |ctx: &mut Counter, session, _data| {
//!         ctx.pings += 1;
//!         session.send("pong", None);
//!     });
//! });
//!
//! let mut mux = Multiplexer::new(registry);
//! let mut ctx = Counter::default();
//! let (tx, mut rx) = tokio::sync::mpsc::channel(8);
//!
//! mux.register(&mut ctx, ConnectionId(1), tx);
//! mux.dispatch_inbound(&mut ctx, ConnectionId(1), r#"{"channel":"ping","event":"ping"}"#)
//!     .unwrap();
//!
//! assert_eq!(ctx.pings, 1);
//! let frame = rx.try_recv().unwrap();
//! assert_eq!(serde_json::to_value(&frame).unwrap(), json!({"channel": "ping", "event": "pong"}));
//! ```

mod channel;
mod error;
mod frame;
mod multiplexer;
mod session;

pub use channel::{Channel, ChannelRegistry, OnConnect};
pub use error::MuxError;
pub use frame::{EventName, InboundFrame, OutboundFrame};
pub use multiplexer::{ConnectionId, Multiplexer};
pub use session::{ChannelSession, Handler, Outbound, SessionHandle};
