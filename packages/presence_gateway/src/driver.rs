//! Runtime side of the connectors.
//!
//! Every upstream stream gets a pump task that forwards its items to the
//! gateway queue until the stream finishes or its handle is cancelled.
//! Reconnect timers are plain sleeping tasks that post the stream key back
//! to the queue; whether the reconnect still makes sense is decided when the
//! gateway receives it.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connector::{StreamDriver, StreamEvent, StreamHandle, StreamKey, StreamKind};
use crate::gateway::GatewayEvent;
use crate::upstream::{PresenceClient, PresenceStatus, UpstreamStream};

pub struct TokioDriver {
    client: Arc<dyn PresenceClient>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl TokioDriver {
    pub fn new(client: Arc<dyn PresenceClient>, events: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self { client, events }
    }
}

impl StreamDriver for TokioDriver {
    fn open(&mut self, key: &StreamKey) -> StreamHandle {
        let stream = match key.kind {
            StreamKind::Connect => self.client.connect(&key.subject),
            StreamKind::Monitor => self.client.monitor(&key.subject),
        };
        let cancel = CancellationToken::new();
        tokio::spawn(pump(key.clone(), stream, cancel.clone(), self.events.clone()));
        StreamHandle::new(cancel)
    }

    fn schedule_reconnect(&mut self, key: &StreamKey, delay: Duration) {
        let key = key.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(GatewayEvent::Reconnect(key));
        });
    }
}

/// Forward one stream's items until it finishes or is cancelled.
///
/// Cancellation is local, so it produces no terminal event. The stream is
/// dropped on exit, which cancels the call upstream.
async fn pump(
    key: StreamKey,
    mut stream: UpstreamStream,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(stream = %key, "Pump stopped by cancellation");
                return;
            }
            item = stream.next() => item,
        };

        let (event, last) = match item {
            Some(Ok(update)) => (StreamEvent::Data(PresenceStatus::from(update)), false),
            Some(Err(err)) => (StreamEvent::from(err), true),
            None => (StreamEvent::End, true),
        };
        let upstream = GatewayEvent::Upstream {
            key: key.clone(),
            event,
        };
        if events.send(upstream).is_err() || last {
            return;
        }
    }
}
