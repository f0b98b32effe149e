//! WebSocket front end: `/gotapi/websocket`.
//!
//! A connection first presents its access token in a verification frame,
//! then sends command frames that are answered like HTTP requests. Plugin
//! events for the connection's token are pushed in between, unsolicited.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use gotapi_core::config::Config;
use gotapi_core::{GatewayError, Subscriber};
use gotapi_types::{Command, ErrorKind, FrameError, Reply, param};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::{ACCESS_DENIED, respond};
use crate::server::AppState;

const CONNECTION_LIMIT: &str = "The number of WebSocket connections reached the limit.";
const TOKEN_TIMEOUT: &str = "No access token was posted in time.";

/// WebSocket limits plus the live connection count.
#[derive(Debug)]
pub struct WsSettings {
    limit: usize,
    token_timeout: Duration,
    verify: bool,
    active: AtomicUsize,
}

impl WsSettings {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            limit: config.ws_connection_limit,
            token_timeout: config.ws_access_token_timeout(),
            verify: config.ws_verify_access_token,
            active: AtomicUsize::new(0),
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// One counted connection; the count drops with it.
struct ConnectionSlot(Arc<WsSettings>);

impl ConnectionSlot {
    fn acquire(settings: &Arc<WsSettings>) -> Option<Self> {
        settings
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < settings.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(settings)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    if !state.access.allows_address(addr.ip()) || !state.access.allows_origin(origin.as_deref()) {
        debug!("Rejected WebSocket from {addr}: access restriction");
        return respond(GatewayError::not_authorized(ACCESS_DENIED).into(), origin);
    }

    let Some(slot) = ConnectionSlot::acquire(&state.ws) else {
        warn!("Rejected WebSocket from {addr}: connection limit reached");
        let error = GatewayError::with_status(ErrorKind::Error, 503, CONNECTION_LIMIT);
        return respond(error.into(), origin);
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, slot, addr, origin))
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    slot: ConnectionSlot,
    addr: SocketAddr,
    origin: Option<String>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!("[ws {conn_id}] Connected from {addr}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();

    let writer_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(e) => {
                    warn!("[ws {writer_id}] Failed to encode reply: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!("[ws {writer_id}] Write loop closed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    if let Some(token) = verify(&state, &conn_id, &mut ws_rx, &tx).await {
        serve_commands(&state, &conn_id, &mut ws_rx, &tx, origin).await;
        if let Some(token) = token {
            state.core.unsubscribe(&token, &tx).await;
        }
    }

    drop(tx);
    let _ = writer.await;
    drop(slot);
    info!("[ws {conn_id}] Disconnected");
}

/// Run the verification step.
///
/// `None` ends the connection; `Some(token)` carries the subscribed token,
/// if any.
async fn verify(
    state: &AppState,
    conn_id: &str,
    ws_rx: &mut SplitStream<WebSocket>,
    tx: &Subscriber,
) -> Option<Option<String>> {
    let frame = match tokio::time::timeout(state.ws.token_timeout, next_text(ws_rx)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(_) => {
            debug!("[ws {conn_id}] No access token within {:?}", state.ws.token_timeout);
            let _ = tx.send(GatewayError::timeout(TOKEN_TIMEOUT).into());
            return None;
        }
    };

    let token = serde_json::from_str::<Value>(&frame)
        .ok()
        .and_then(|v| v.get(param::ACCESS_TOKEN)?.as_str().map(String::from));

    match state
        .core
        .subscribe(token.as_deref(), state.ws.verify, tx.clone())
        .await
    {
        Ok(reply) => {
            debug!("[ws {conn_id}] Verified");
            let _ = tx.send(reply);
            Some(token.filter(|t| !t.is_empty()))
        }
        Err(reply) => {
            debug!("[ws {conn_id}] Access token rejected");
            let _ = tx.send(reply);
            None
        }
    }
}

/// Answer command frames until the socket closes. Each command runs on its
/// own task so a slow plugin does not hold up the others.
async fn serve_commands(
    state: &AppState,
    conn_id: &str,
    ws_rx: &mut SplitStream<WebSocket>,
    tx: &Subscriber,
    origin: Option<String>,
) {
    while let Some(frame) = next_text(ws_rx).await {
        let mut command = match parse_frame(&frame) {
            Ok(command) => command,
            Err(error) => {
                debug!("[ws {conn_id}] Bad frame: {}", error.message);
                let _ = tx.send(error.into());
                continue;
            }
        };
        command.package.clone_from(&origin);

        let core = Arc::clone(&state.core);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = core.handle(command).await;
            let _ = tx.send(reply);
        });
    }
}

fn parse_frame(frame: &str) -> Result<Command, GatewayError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|_| GatewayError::invalid_parameter("The frame is not valid JSON."))?;
    Command::from_frame(value).map_err(|e| match e {
        FrameError::Method(_) => GatewayError::new(ErrorKind::InvalidMethod, e.to_string()),
        FrameError::NotAnObject | FrameError::NotAString(_) => {
            GatewayError::invalid_parameter(e.to_string())
        }
    })
}

/// Next text frame, `None` once the peer closes or the socket fails.
async fn next_text(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_respect_limit() {
        let config = Config {
            ws_connection_limit: 2,
            ..Config::default()
        };
        let settings = Arc::new(WsSettings::new(&config));

        let first = ConnectionSlot::acquire(&settings).unwrap();
        let second = ConnectionSlot::acquire(&settings).unwrap();
        assert!(ConnectionSlot::acquire(&settings).is_none());
        assert_eq!(settings.active(), 2);

        drop(first);
        assert_eq!(settings.active(), 1);
        assert!(ConnectionSlot::acquire(&settings).is_some());
        drop(second);
    }

    #[test]
    fn test_parse_frame_errors() {
        let err = parse_frame("not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        let err = parse_frame("[1]").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        let err = parse_frame(r#"{"method": "patch", "profile": "light"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMethod);
    }

    #[test]
    fn test_parse_frame_command() {
        let command = parse_frame(
            r#"{"method": "put", "profile": "clock", "attribute": "ticktack", "serviceId": "c1"}"#,
        )
        .unwrap();
        assert_eq!(command.profile, "clock");
        assert_eq!(command.service_id(), "c1");
    }
}
