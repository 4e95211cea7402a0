//! Server network layer handling the HTTP and WebSocket surface
//!
//! Two routes:
//! - `GET /creategame` allocates a session and answers `{"id": ...}`
//! - `GET /ws?token=...` upgrades to the persistent connection
//!
//! Each socket gets a reader loop (inbound frames go to the [`Hub`]) and a
//! writer task that drains the connection's outbound queue and sends pings.

use crate::client_manager::Connection;
use crate::hub::Hub;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{Envelope, NewClient, NEW_CLIENT};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedSession {
    pub id: String,
}

/// A client that brings no token gets a fresh one.
pub fn resolve_token(requested: String) -> String {
    if requested.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        requested
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/creategame", get(create_game))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Serves until the listener fails.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> std::io::Result<()> {
    info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(hub)).await
}

async fn create_game(State(hub): State<Arc<Hub>>) -> Json<CreatedSession> {
    let id = hub.create_session().await;
    Json(CreatedSession { id })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    let token = resolve_token(params.token);
    ws.on_upgrade(move |socket| handle_socket(socket, token, hub))
}

/// Runs one connection from upgrade to disconnect.
async fn handle_socket(socket: WebSocket, token: String, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let timing = hub.config().timing.clone();

    let (tx, mut rx) = mpsc::channel::<Arc<String>>(hub.config().outbound_buffer);
    let connection = Arc::new(Connection::new(token, tx));
    hub.register(Arc::clone(&connection)).await;

    let hello = NewClient {
        token: connection.token.clone(),
    };
    match Envelope::new(NEW_CLIENT, &hello) {
        Ok(envelope) => {
            connection.send_envelope(&envelope);
        }
        Err(e) => warn!("Failed to build {} envelope: {}", NEW_CLIENT, e),
    }

    // Writer: outbound queue and keep-alive pings
    let writer = {
        let connection = Arc::clone(&connection);
        let ping_period = timing.ping_period;
        tokio::spawn(async move {
            let mut ping = interval_at(Instant::now() + ping_period, ping_period);
            loop {
                tokio::select! {
                    _ = connection.closed() => break,
                    outbound = rx.recv() => {
                        let Some(text) = outbound else { break };
                        if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            connection.close();
        })
    };

    // Reader: any frame, including a pong, resets the idle timer
    loop {
        let frame = tokio::select! {
            _ = connection.closed() => break,
            frame = timeout(timing.idle_timeout, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                info!("Client {} idle for {:?}", connection.token, timing.idle_timeout);
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!("Read error from {}: {}", connection.token, e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => hub.handle_text(&connection, text.as_str()).await,
            Ok(Some(Ok(Message::Binary(data)))) => match std::str::from_utf8(&data) {
                Ok(text) => hub.handle_text(&connection, text).await,
                Err(_) => warn!("Dropping non-UTF8 frame from {}", connection.token),
            },
            Ok(Some(Ok(_))) => {}
        }
    }

    connection.close();
    let _ = writer.await;
    debug!(
        "Client {} was connected for {:?}",
        connection.token,
        connection.connected_at.elapsed()
    );
    hub.unregister(&connection).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_token_keeps_given() {
        assert_eq!(resolve_token("abc".to_string()), "abc");
    }

    #[test]
    fn test_resolve_token_generates_uuid() {
        let first = resolve_token(String::new());
        let second = resolve_token(String::new());

        assert!(Uuid::parse_str(&first).is_ok());
        assert_ne!(first, second);
    }

    #[test]
    fn test_connect_params_token_optional() {
        let params: ConnectParams = serde_json::from_str("{}").unwrap();
        assert!(params.token.is_empty());
    }

    #[test]
    fn test_created_session_shape() {
        let body = serde_json::to_string(&CreatedSession {
            id: "quiet-river".to_string(),
        })
        .unwrap();
        assert_eq!(body, r#"{"id":"quiet-river"}"#);
    }
}
