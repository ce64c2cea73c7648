//! WebSocket transport
//!
//! Each socket becomes one multiplexer connection. A writer task drains the
//! connection's outbound queue into the socket; the input loop forwards text
//! frames to the gateway. When either side stops, the gateway is told the
//! connection failed (if the socket errored) and then that it closed.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use channel_mux::{ConnectionId, MuxError, OutboundFrame};
use futures::{sink::SinkExt, stream::StreamExt};
use std::path::Path;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::gateway::GatewayHandle;

#[derive(Clone)]
pub struct WsState {
    pub gateway: GatewayHandle,
    /// Outbound frames buffered per connection
    pub send_capacity: usize,
}

/// `/ws` for clients, `/health` for probes, and `static_dir` at `/` if set.
pub fn router(state: WsState, static_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state);

    match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// How the input loop ended.
enum InputEnd {
    Closed,
    Failed(String),
    GatewayGone,
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let WsState {
        gateway,
        send_capacity,
    } = state;

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(send_capacity.max(1));
    let id = match gateway.connect(tx) {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing WebSocket connection: {}", e);
            return;
        }
    };
    info!(conn_id = %id, "New WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!(conn_id = %id, "Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    };

    let input_gateway = gateway.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(conn_id = %id, "Dropping binary frame that is not UTF-8");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return InputEnd::Closed,
                Ok(_) => continue,
                Err(e) => return InputEnd::Failed(e.to_string()),
            };
            if forward(&input_gateway, id, text).is_err() {
                return InputEnd::GatewayGone;
            }
        }
        InputEnd::Closed
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %id, "Sender task ended"),
        end = input_task => match end {
            InputEnd::Closed => debug!(conn_id = %id, "Client closed the connection"),
            InputEnd::Failed(error) => {
                let _ = gateway.error(id, error);
            }
            InputEnd::GatewayGone => debug!(conn_id = %id, "Gateway stopped"),
        },
    }

    let _ = gateway.close(id);
    info!(conn_id = %id, "WebSocket connection closed");
}

fn forward(gateway: &GatewayHandle, id: ConnectionId, text: String) -> Result<(), MuxError> {
    debug!(conn_id = %id, len = text.len(), "Inbound frame");
    gateway.frame(id, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::DEFAULT_RECONNECT_DELAY;
    use crate::gateway;
    use crate::upstream::VoteBackend;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite;

    async fn serve(
        backend: &VoteBackend,
        static_dir: Option<&Path>,
    ) -> (SocketAddr, GatewayHandle) {
        let gateway = gateway::spawn(Arc::new(backend.clone()), DEFAULT_RECONNECT_DELAY);
        let state = WsState {
            gateway: gateway.clone(),
            send_capacity: 16,
        };
        let app = router(state, static_dir);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, gateway)
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_presence_over_websocket() {
        let backend = VoteBackend::new();
        let (addr, gateway) = serve(&backend, None).await;
        let url = format!("ws://{}/ws", addr);

        let (mut watcher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let monitor = json!({"channel": "presence", "event": "monitor", "data": "bob"});
        watcher
            .send(tungstenite::Message::text(monitor.to_string()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut watcher).await,
            json!({"channel": "presence", "event": "offline", "data": "bob"})
        );

        // Binary frames carry the same JSON
        let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let connectas = json!({"channel": "presence", "event": "connectas", "data": "bob"});
        bob.send(tungstenite::Message::binary(connectas.to_string().into_bytes()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut watcher).await,
            json!({"channel": "presence", "event": "online", "data": "bob"})
        );

        bob.close(None).await.unwrap();
        assert_eq!(
            next_json(&mut watcher).await,
            json!({"channel": "presence", "event": "offline", "data": "bob"})
        );

        gateway.shutdown().await;
        assert!(!backend.is_online("bob"));
    }

    #[tokio::test]
    async fn test_garbage_frames_do_not_close_socket() {
        let backend = VoteBackend::new();
        let (addr, _gateway) = serve(&backend, None).await;
        let url = format!("ws://{}/ws", addr);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        for text in ["{", r#"{"channel":"nope","event":"x"}"#, r#"{"event":"monitor"}"#] {
            ws.send(tungstenite::Message::text(text)).await.unwrap();
        }
        let monitor = json!({"channel": "presence", "event": "monitor", "data": "amy"});
        ws.send(tungstenite::Message::text(monitor.to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["event"], "offline");
    }

    #[tokio::test]
    async fn test_health_and_static_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>presence</h1>").unwrap();
        let backend = VoteBackend::new();
        let (addr, _gateway) = serve(&backend, Some(dir.path())).await;

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let index = http_get(addr, "/index.html").await;
        assert!(index.starts_with("HTTP/1.1 200"));
        assert!(index.contains("<h1>presence</h1>"));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
