//! Web chat channel: WebSocket-based real-time chat for browser clients.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse, StatusUpdate};
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "web";

// ── JSON Protocol ───────────────────────────────────────────────────────

/// Message from client → server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Message {
        content: String,
        thread_id: Option<String>,
    },
}

/// Message from server → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Response {
        content: String,
        thread_id: Option<String>,
    },
    Typing,
    Status {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    user: Option<String>,
}

// ── Shared State ────────────────────────────────────────────────────────

/// An outgoing frame addressed to every socket of one user.
#[derive(Debug, Clone)]
struct Addressed {
    user_id: String,
    message: ServerMessage,
}

struct WebChannelInner {
    /// WS handlers → `Channel::start` stream.
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
    /// `respond` / `send_status` → WS handlers, filtered per user.
    outgoing_tx: broadcast::Sender<Addressed>,
}

impl WebChannelInner {
    fn publish(&self, user_id: &str, message: ServerMessage) {
        // No subscribers means no connected clients.
        let _ = self.outgoing_tx.send(Addressed {
            user_id: user_id.to_string(),
            message,
        });
    }
}

#[derive(Clone)]
struct WsState {
    inner: Arc<WebChannelInner>,
}

// ── WebChannel ──────────────────────────────────────────────────────────

/// WebSocket chat channel served at `/ws/chat?user=<id>`.
///
/// - `start()` returns a stream backed by an mpsc receiver that every socket
///   handler feeds.
/// - `respond()` / `send_status()` broadcast frames tagged with the user id;
///   each socket forwards only the frames for the user it connected as.
/// - A user may hold several sockets (tabs, reconnects); all of them see the
///   replies.
pub struct WebChannel {
    inner: Arc<WebChannelInner>,
    /// Consumed once in `start()`.
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
}

impl Default for WebChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChannel {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(WebChannelInner {
                incoming_tx,
                outgoing_tx,
            }),
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Axum router with the `/ws/chat` endpoint, to be merged into the app.
    pub fn router(&self) -> Router {
        let state = WsState {
            inner: Arc::clone(&self.inner),
        };

        Router::new()
            .route("/ws/chat", get(ws_chat_handler))
            .with_state(state)
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = self
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: CHANNEL_NAME.to_string(),
                reason: "start() already called".to_string(),
            })?;

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.inner.publish(
            &msg.user_id,
            ServerMessage::Response {
                content: response.content,
                thread_id: msg.thread_id.clone(),
            },
        );
        Ok(())
    }

    async fn send_status(
        &self,
        msg: &IncomingMessage,
        status: StatusUpdate,
    ) -> Result<(), ChannelError> {
        let frame = match status {
            StatusUpdate::Typing => ServerMessage::Typing,
            StatusUpdate::Status(message) => ServerMessage::Status { message },
        };
        self.inner.publish(&msg.user_id, frame);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

// ── WebSocket Handler ───────────────────────────────────────────────────

async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ChatParams>,
    State(state): State<WsState>,
) -> Response {
    let Some(user_id) = params
        .user
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "missing `user` query parameter").into_response();
    };

    info!(user_id = %user_id, "Web chat client connecting");
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state.inner, user_id))
}

async fn handle_chat_socket(mut socket: WebSocket, inner: Arc<WebChannelInner>, user_id: String) {
    let mut outgoing_rx = inner.outgoing_tx.subscribe();

    loop {
        tokio::select! {
            result = outgoing_rx.recv() => {
                match result {
                    Ok(frame) if frame.user_id == user_id => {
                        if let Ok(json) = serde_json::to_string(&frame.message) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!(user_id = %user_id, "Web chat client disconnected during send");
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user_id = %user_id, missed = n, "Web chat client lagged behind broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Web chat broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Message { content, thread_id }) => {
                                let content = content.trim();
                                if content.is_empty() {
                                    continue;
                                }
                                let mut msg = IncomingMessage::new(CHANNEL_NAME, &user_id, content)
                                    .with_metadata(serde_json::json!({ "user_id": user_id }));
                                if let Some(ref tid) = thread_id {
                                    msg = msg.with_thread(tid);
                                }
                                if inner.incoming_tx.send(msg).is_err() {
                                    warn!("Web incoming channel closed");
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, text = %text, "Invalid JSON from web client");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Web chat WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(user_id = %user_id, "Web chat connection closed");
}
