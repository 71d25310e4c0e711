//! WebSocket subscriber sessions.
//!
//! Subscribers send `{"cmd":"joinRoom","roomId":N}` and
//! `{"cmd":"leaveRoom","roomId":N}` text frames and receive the normalized
//! danmaku for their joined rooms as JSON. Disconnecting implies a leave for
//! every room the session had joined.

use std::collections::HashSet;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::server::AppState;

/// Optional auth token via query parameter, for clients that cannot set
/// headers.
#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    pub token: Option<String>,
}

/// Commands a subscriber session may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: u64 },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: u64 },
}

/// Check the configured token against the Authorization header or the query
/// parameter. A relay without a configured token accepts everyone.
fn authorized(expected: Option<&str>, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let presented = value.strip_prefix("Basic ").unwrap_or(value);
        if presented == expected {
            return true;
        }
    }

    query_token == Some(expected)
}

/// Upgrade handler for subscriber connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !authorized(state.basic_auth.as_deref(), &headers, params.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut danmaku_rx = state.relay.subscribe();
    let mut joined: HashSet<u64> = HashSet::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::JoinRoom { room_id }) => {
                                // Duplicate joins from one session count once,
                                // so the pool refcount matches the session's
                                // room set.
                                if joined.insert(room_id) {
                                    state.relay.on_subscriber_join(room_id).await;
                                }
                            }
                            Ok(ClientCommand::LeaveRoom { room_id }) => {
                                if joined.remove(&room_id) {
                                    state.relay.on_subscriber_leave(room_id).await;
                                }
                            }
                            Err(e) => {
                                debug!("Ignoring malformed client message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Subscriber socket error: {}", e);
                        break;
                    }
                }
            }

            item = danmaku_rx.recv() => {
                match item {
                    Ok(danmaku) => {
                        if !joined.contains(&danmaku.room_id) {
                            continue;
                        }
                        match serde_json::to_string(&danmaku) {
                            Ok(json) => {
                                if socket.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Failed to serialize danmaku: {}", e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscriber lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Implicit leave for everything the session still held.
    for room_id in joined {
        state.relay.on_subscriber_leave(room_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_command_parse() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"joinRoom","roomId":7}"#).unwrap();
        assert_eq!(cmd, ClientCommand::JoinRoom { room_id: 7 });

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"leaveRoom","roomId":7}"#).unwrap();
        assert_eq!(cmd, ClientCommand::LeaveRoom { room_id: 7 });

        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"dance"}"#).is_err());
    }

    #[test]
    fn test_authorized_without_configured_token() {
        assert!(authorized(None, &HeaderMap::new(), None));
    }

    #[test]
    fn test_authorized_header_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic secret"),
        );
        assert!(authorized(Some("secret"), &headers, None));
        assert!(authorized(Some("secret"), &HeaderMap::new(), Some("secret")));

        assert!(!authorized(Some("secret"), &HeaderMap::new(), None));
        assert!(!authorized(Some("secret"), &HeaderMap::new(), Some("wrong")));
    }
}
