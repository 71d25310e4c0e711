//! Bilibili live-room connection factory.
//!
//! Implements the upstream side of the relay: a room-init API lookup for the
//! real room id, a danmu-info API lookup for the WebSocket host and auth
//! token, and two transports speaking the binary frame protocol in
//! [`crate::upstream::packet`] — WebSocket and raw TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::upstream::connection::{ConnectionParts, RoomConnection, RoomEvent};
use crate::upstream::factory::{TransportMode, UpstreamFactory};
use crate::upstream::packet::{self, op};

/// Fallback WebSocket endpoint when the danmu-info API is unavailable.
const DEFAULT_WS_URL: &str = "wss://broadcastlv.chat.bilibili.com/sub";

/// Raw TCP endpoint.
const TCP_HOST: &str = "broadcastlv.chat.bilibili.com";
const TCP_PORT: u16 = 2243;

/// Heartbeat interval mandated by the platform.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// API request timeout.
const API_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const LIVE_REFERER: &str = "https://live.bilibili.com";

/// Room init API response.
#[derive(Debug, Deserialize)]
struct RoomInitResponse {
    code: i32,
    data: Option<RoomInitData>,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    room_id: u64,
}

/// Authentication payload sent as the first packet.
#[derive(Debug, Serialize)]
struct AuthData {
    uid: u64,
    roomid: u64,
    protover: u8,
    platform: &'static str,
    #[serde(rename = "type")]
    auth_type: u8,
    key: String,
}

/// Factory producing Bilibili upstream connections.
pub struct BilibiliFactory {
    mode: TransportMode,
    client: Client,
}

impl BilibiliFactory {
    /// Create a factory for the given transport mode.
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            client: Client::new(),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Resolve a possibly-short room id to the real room id.
    async fn real_room_id(&self, short_id: u64) -> Result<u64> {
        let url = format!(
            "https://api.live.bilibili.com/room/v1/Room/room_init?id={}",
            short_id
        );

        let resp: RoomInitResponse = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::REFERER, LIVE_REFERER)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::connection(format!("Failed to get room info: {e}")))?
            .json()
            .await
            .map_err(|e| Error::protocol(format!("Failed to parse room info: {e}")))?;

        if resp.code != 0 {
            return Err(Error::protocol("Room init API returned error"));
        }

        resp.data
            .map(|d| d.room_id)
            .ok_or_else(|| Error::protocol("No room data in response"))
    }

    /// Get the WebSocket host and auth token for a room.
    ///
    /// Falls back to the default host and an empty token when the API
    /// declines the request.
    async fn danmu_info(&self, room_id: u64) -> Result<(String, String)> {
        let url = format!(
            "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo?id={}&type=0",
            room_id
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::REFERER, LIVE_REFERER)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::connection(format!("Failed to get danmu info: {e}")))?
            .text()
            .await
            .map_err(|e| Error::protocol(format!("Failed to read response: {e}")))?;

        let json: Value = serde_json::from_str(&response)
            .map_err(|e| Error::protocol(format!("Invalid JSON: {e}")))?;

        let code = json.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            debug!(
                "getDanmuInfo returned error code {}: {}, using default WebSocket URL",
                code, msg
            );
            return Ok((DEFAULT_WS_URL.to_string(), String::new()));
        }

        let data = json
            .get("data")
            .ok_or_else(|| Error::protocol("Missing data field in response"))?;

        let token = data
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let ws_url = data
            .get("host_list")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|host| {
                let h = host.get("host")?.as_str()?;
                let p = host.get("wss_port")?.as_u64()?;
                Some(format!("wss://{}:{}/sub", h, p))
            })
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string());

        debug!("Got token and WebSocket URL: {}", ws_url);
        Ok((ws_url, token))
    }

    async fn connect_ws(&self, room_id: u64) -> Result<RoomConnection> {
        let real_room_id = self.real_room_id(room_id).await?;
        let (ws_url, token) = self.danmu_info(real_room_id).await?;

        let request = build_ws_request(&ws_url)?;
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

        let (mut connection, parts) = RoomConnection::new(room_id);
        let auth = build_auth_packet(real_room_id, &token);
        connection.attach_task(tokio::spawn(run_ws_io(room_id, ws_stream, auth, parts)));
        Ok(connection)
    }

    async fn connect_tcp(&self, room_id: u64) -> Result<RoomConnection> {
        let real_room_id = self.real_room_id(room_id).await?;
        let (_ws_url, token) = self.danmu_info(real_room_id).await?;

        let stream = TcpStream::connect((TCP_HOST, TCP_PORT))
            .await
            .map_err(|e| Error::connection(format!("TCP connect failed: {e}")))?;

        let (mut connection, parts) = RoomConnection::new(room_id);
        let auth = build_auth_packet(real_room_id, &token);
        connection.attach_task(tokio::spawn(run_tcp_io(room_id, stream, auth, parts)));
        Ok(connection)
    }
}

#[async_trait]
impl UpstreamFactory for BilibiliFactory {
    async fn create(&self, room_id: u64) -> Result<RoomConnection> {
        match self.mode {
            TransportMode::WebSocket => self.connect_ws(room_id).await,
            TransportMode::Tcp => self.connect_tcp(room_id).await,
        }
    }
}

/// Build the WebSocket upgrade request with the headers the platform expects.
fn build_ws_request(
    url: &str,
) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
    use tokio_tungstenite::tungstenite::handshake::client::generate_key;
    use tokio_tungstenite::tungstenite::http::{Request, Uri};

    let uri: Uri = url
        .parse()
        .map_err(|e| Error::connection(format!("Invalid WebSocket URL: {e}")))?;
    let host = uri.host().unwrap_or(TCP_HOST);
    let host_header = match uri.port_u16() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    };

    Request::builder()
        .uri(url)
        .header("Host", host_header)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("User-Agent", USER_AGENT)
        .header("Origin", LIVE_REFERER)
        .header("Referer", LIVE_REFERER)
        .body(())
        .map_err(|e| Error::connection(format!("Failed to build request: {e}")))
}

/// Build the authentication packet (operation 7).
fn build_auth_packet(room_id: u64, token: &str) -> Bytes {
    let auth_data = AuthData {
        uid: 0,
        roomid: room_id,
        protover: 3, // Request Brotli compression
        platform: "web",
        auth_type: 2,
        key: token.to_string(),
    };

    // Serializing a struct of scalars and a string cannot fail.
    let json_data = serde_json::to_vec(&auth_data).unwrap_or_default();
    Bytes::from(packet::build_packet(&json_data, op::AUTH))
}

/// Convert one decoded frame into a room event, if it carries one.
///
/// Only `DANMU_MSG` notifications (and their suffixed variants such as
/// `DANMU_MSG:4:0:2:2:2:0`) become [`RoomEvent::Danmu`]; every other
/// notification is ignored.
fn frame_event(
    decoded: &packet::DecodedPacket,
    live: &Arc<AtomicBool>,
) -> Option<RoomEvent> {
    match decoded.operation {
        op::AUTH_REPLY => {
            live.store(true, Ordering::SeqCst);
            Some(RoomEvent::Live)
        }
        op::NOTIFICATION => {
            let json: Value = serde_json::from_slice(&decoded.body).ok()?;
            let is_danmu = json
                .get("cmd")
                .and_then(Value::as_str)
                .is_some_and(|cmd| cmd.split(':').next().unwrap_or(cmd) == "DANMU_MSG");
            is_danmu.then_some(RoomEvent::Danmu(json))
        }
        _ => None,
    }
}

/// Forward the events extracted from a binary frame buffer.
///
/// Returns false when the receiving side is gone.
async fn emit_frames(
    data: &[u8],
    live: &Arc<AtomicBool>,
    events_tx: &mpsc::Sender<RoomEvent>,
) -> bool {
    for decoded in packet::decode_packets(data) {
        if let Some(event) = frame_event(&decoded, live)
            && events_tx.send(event).await.is_err()
        {
            return false;
        }
    }
    true
}

/// WebSocket I/O loop: authenticate, heartbeat, read frames until shutdown.
async fn run_ws_io(
    room_id: u64,
    mut stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >,
    auth_packet: Bytes,
    parts: ConnectionParts,
) {
    let ConnectionParts {
        events_tx,
        live,
        shutdown,
    } = parts;

    if let Err(e) = stream.send(Message::Binary(auth_packet)).await {
        error!("Auth handshake failed for room {}: {}", room_id, e);
        let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = stream.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat.tick() => {
                if let Err(e) = stream.send(Message::Binary(Bytes::from_static(packet::HEARTBEAT))).await {
                    error!("Failed to send heartbeat for room {}: {}", room_id, e);
                    live.store(false, Ordering::SeqCst);
                    let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
                    break;
                }
            }

            msg_opt = stream.next() => {
                match msg_opt {
                    Some(Ok(Message::Binary(data))) => {
                        if !emit_frames(&data, &live, &events_tx).await {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error for room {}: {}", room_id, e);
                        live.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        warn!("WebSocket closed by remote for room {}", room_id);
                        live.store(false, Ordering::SeqCst);
                        let _ = events_tx
                            .send(RoomEvent::Error("connection closed by remote".into()))
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

/// Raw TCP I/O loop speaking the same frame protocol as the WebSocket path.
async fn run_tcp_io(room_id: u64, stream: TcpStream, auth_packet: Bytes, parts: ConnectionParts) {
    let ConnectionParts {
        events_tx,
        live,
        shutdown,
    } = parts;

    let (mut read_half, mut write_half) = stream.into_split();

    if let Err(e) = write_half.write_all(&auth_packet).await {
        error!("Auth handshake failed for room {}: {}", room_id, e);
        let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write_half.shutdown().await;
                break;
            }

            _ = heartbeat.tick() => {
                if let Err(e) = write_half.write_all(packet::HEARTBEAT).await {
                    error!("Failed to send heartbeat for room {}: {}", room_id, e);
                    live.store(false, Ordering::SeqCst);
                    let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
                    break;
                }
            }

            read = read_half.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        warn!("TCP connection closed by remote for room {}", room_id);
                        live.store(false, Ordering::SeqCst);
                        let _ = events_tx
                            .send(RoomEvent::Error("connection closed by remote".into()))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        let consumed = drain_frames(&mut buffer, &live, &events_tx).await;
                        if !consumed {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TCP error for room {}: {}", room_id, e);
                        live.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(RoomEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Pull complete frames off the front of the buffer and emit their events.
///
/// Leaves any trailing partial frame in place for the next read.
async fn drain_frames(
    buffer: &mut Vec<u8>,
    live: &Arc<AtomicBool>,
    events_tx: &mpsc::Sender<RoomEvent>,
) -> bool {
    use byteorder::{BigEndian, ByteOrder};

    while buffer.len() >= packet::HEADER_LEN {
        let packet_len = BigEndian::read_u32(&buffer[0..4]) as usize;
        if packet_len < packet::HEADER_LEN {
            // Corrupt length prefix; drop the buffer rather than loop forever.
            warn!("Corrupt frame header (length {}), resetting buffer", packet_len);
            buffer.clear();
            break;
        }
        if buffer.len() < packet_len {
            break;
        }

        let frame: Vec<u8> = buffer.drain(..packet_len).collect();
        if !emit_frames(&frame, live, events_tx).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap_notification(payload: &Value) -> Vec<u8> {
        packet::build_packet(payload.to_string().as_bytes(), op::NOTIFICATION)
    }

    #[test]
    fn test_auth_packet_shape() {
        let auth = build_auth_packet(7, "tok");
        let decoded: Value =
            serde_json::from_slice(&auth[packet::HEADER_LEN..]).expect("valid json body");

        assert_eq!(decoded["roomid"], 7);
        assert_eq!(decoded["uid"], 0);
        assert_eq!(decoded["key"], "tok");
        assert_eq!(decoded["type"], 2);
    }

    #[test]
    fn test_frame_event_auth_reply_marks_live() {
        let live = Arc::new(AtomicBool::new(false));
        let decoded = packet::DecodedPacket {
            operation: op::AUTH_REPLY,
            body: b"{\"code\":0}".to_vec(),
        };

        let event = frame_event(&decoded, &live);
        assert!(matches!(event, Some(RoomEvent::Live)));
        assert!(live.load(Ordering::SeqCst));
    }

    #[test]
    fn test_frame_event_filters_non_danmu() {
        let live = Arc::new(AtomicBool::new(true));
        let gift = packet::DecodedPacket {
            operation: op::NOTIFICATION,
            body: json!({"cmd": "SEND_GIFT", "data": {}}).to_string().into_bytes(),
        };
        assert!(frame_event(&gift, &live).is_none());

        let danmu = packet::DecodedPacket {
            operation: op::NOTIFICATION,
            body: json!({"cmd": "DANMU_MSG:4:0:2:2:2:0", "info": []})
                .to_string()
                .into_bytes(),
        };
        assert!(matches!(frame_event(&danmu, &live), Some(RoomEvent::Danmu(_))));
    }

    #[tokio::test]
    async fn test_drain_frames_keeps_partial_tail() {
        let live = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel(8);

        let payload = json!({"cmd": "DANMU_MSG", "info": []});
        let mut buffer = wrap_notification(&payload);
        let second = wrap_notification(&payload);
        // Append only the first half of the second frame.
        buffer.extend_from_slice(&second[..second.len() / 2]);
        let tail_len = second.len() / 2;

        assert!(drain_frames(&mut buffer, &live, &tx).await);
        assert!(matches!(rx.try_recv(), Ok(RoomEvent::Danmu(_))));
        assert_eq!(buffer.len(), tail_len);
    }
}
