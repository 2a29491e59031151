//! MQTT over WebSocket：协商 `mqtt` 子协议，二进制帧桥接为字节流后复用同一会话状态机。

use super::broker::MqttBroker;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

pub const SUBPROTOCOL: &str = "mqtt";
const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";
const BRIDGE_BUFFER: usize = 64 * 1024;

/// 客户端声明的子协议包含 `mqtt` 时回应该子协议。
fn negotiate(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(PROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|item| item.trim() == SUBPROTOCOL));
    if offered {
        response
            .headers_mut()
            .insert(PROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

/// WebSocket 接入循环。
pub async fn serve(broker: Arc<MqttBroker>, listener: TcpListener) {
    let local = listener.local_addr().ok();
    info!(target: "gw.mqtt", addr = ?local, "mqtt_ws_listener_started");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    handle_connection(broker, stream, peer).await;
                });
            }
            Err(err) => {
                error!(target: "gw.mqtt", error = %err, "mqtt_ws_accept_failed");
            }
        }
    }
}

async fn handle_connection(broker: Arc<MqttBroker>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_hdr_async(stream, negotiate).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(target: "gw.mqtt", peer = %peer, error = %err, "mqtt_ws_handshake_failed");
            return;
        }
    };
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (broker_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // WebSocket → 会话
    let inbound = tokio::spawn(async move {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if bridge_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    debug!(target: "gw.mqtt", error = %err, "mqtt_ws_read_failed");
                    break;
                }
            }
        }
        let _ = bridge_write.shutdown().await;
    });

    // 会话 → WebSocket
    let outbound = tokio::spawn(async move {
        let mut buf = vec![0u8; BRIDGE_BUFFER];
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    broker.handle_connection(broker_side, peer).await;
    inbound.abort();
    let _ = outbound.await;
}
