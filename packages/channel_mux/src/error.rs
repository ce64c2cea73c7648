use crate::multiplexer::ConnectionId;

/// Reasons an inbound frame was dropped without reaching a session.
///
/// None of these are fatal: the connection stays open and later frames are
/// dispatched normally.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The frame was not a JSON object of the expected shape
    #[error("error parsing message as JSON: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// The frame parsed but carried no `channel` field
    #[error("message without a channel")]
    MissingChannel,

    /// The frame named a channel this connection has no session for
    #[error("message with unknown channel: {0}")]
    UnknownChannel(String),

    /// The connection was never registered, or has already closed
    #[error("unknown or closed connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The multiplexer is shutting down and no longer accepts frames
    #[error("multiplexer is shut down")]
    ShutDown,
}
