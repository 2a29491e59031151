//! LoRa/Zigbee 网关共用的 TCP 接入层。
//!
//! 帧格式：2 字节大端长度前缀 + 8 字节网关 EUI + 载荷。
//! 同一 EUI 的新连接接管旧连接；连接断开时只有仍持有登记的连接才通知关闭。

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use gw_driver::DriverError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

pub(crate) const EUI_LEN: usize = 8;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .big_endian()
        .max_frame_length(usize::from(u16::MAX))
        .new_codec()
}

/// 拆出网关 EUI（大写十六进制）与载荷。
pub(crate) fn split_frame(frame: &[u8]) -> Option<(String, &[u8])> {
    if frame.len() < EUI_LEN {
        return None;
    }
    let (eui, body) = frame.split_at(EUI_LEN);
    Some((eui_hex(eui), body))
}

pub(crate) fn eui_hex(raw: &[u8]) -> String {
    raw.iter().map(|byte| format!("{byte:02X}")).collect()
}

/// 上行帧回调。
#[async_trait]
pub(crate) trait FrameHandler: Send + Sync {
    async fn on_frame(&self, gateway: &str, body: &[u8]);

    async fn on_gateway_closed(&self, gateway: &str);
}

#[derive(Clone)]
struct GatewayEntry {
    connection_id: String,
    raw_eui: [u8; EUI_LEN],
    tx: mpsc::UnboundedSender<Bytes>,
}

type Gateways = Arc<RwLock<HashMap<String, GatewayEntry>>>;

#[derive(Default)]
pub(crate) struct GatewayLink {
    gateways: Gateways,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl GatewayLink {
    /// 绑定端口并启动接入任务。
    pub(crate) async fn start(
        &self,
        port: u16,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<JoinHandle<()>, DriverError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|err| DriverError::Transport(format!("bind port {port}: {err}")))?;
        let addr = listener.local_addr().map_err(DriverError::transport)?;
        *self.local_addr.write().await = Some(addr);
        info!(target: "gw.tcp", addr = %addr, "gateway_listener_started");

        let gateways = Arc::clone(&self.gateways);
        Ok(tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                while connections.try_join_next().is_some() {}
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let gateways = Arc::clone(&gateways);
                        let handler = Arc::clone(&handler);
                        connections.spawn(serve_gateway(stream, peer, gateways, handler));
                    }
                    Err(err) => {
                        error!(target: "gw.tcp", error = %err, "gateway_accept_failed");
                    }
                }
            }
        }))
    }

    pub(crate) async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// 向网关发送一帧（自动加上 EUI）。
    pub(crate) async fn send(&self, gateway: &str, body: &[u8]) -> bool {
        let Some(entry) = self.gateways.read().await.get(gateway).cloned() else {
            return false;
        };
        let mut frame = BytesMut::with_capacity(EUI_LEN + body.len());
        frame.put_slice(&entry.raw_eui);
        frame.put_slice(body);
        entry.tx.send(frame.freeze()).is_ok()
    }

    pub(crate) async fn is_connected(&self, gateway: &str) -> bool {
        self.gateways.read().await.contains_key(gateway)
    }

    pub(crate) async fn gateways(&self) -> Vec<String> {
        let mut gateways: Vec<String> = self.gateways.read().await.keys().cloned().collect();
        gateways.sort();
        gateways
    }

    pub(crate) async fn clear(&self) {
        self.gateways.write().await.clear();
        *self.local_addr.write().await = None;
    }
}

async fn serve_gateway(
    stream: TcpStream,
    peer: SocketAddr,
    gateways: Gateways,
    handler: Arc<dyn FrameHandler>,
) {
    let connection_id = gw_telemetry::new_connection_id();
    let (mut sink, mut frames) = Framed::new(stream, codec()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<String> = None;
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "gw.tcp", peer = %peer, error = %err, "gateway_frame_invalid");
                break;
            }
        };
        let Some((gateway, body)) = split_frame(&frame) else {
            debug!(target: "gw.tcp", peer = %peer, bytes = frame.len(), "gateway_frame_too_short");
            continue;
        };
        if registered.as_deref() != Some(gateway.as_str()) {
            let mut raw_eui = [0u8; EUI_LEN];
            raw_eui.copy_from_slice(&frame[..EUI_LEN]);
            gateways.write().await.insert(
                gateway.clone(),
                GatewayEntry {
                    connection_id: connection_id.clone(),
                    raw_eui,
                    tx: tx.clone(),
                },
            );
            info!(target: "gw.tcp", gateway = %gateway, peer = %peer, "gateway_registered");
            registered = Some(gateway.clone());
        }
        handler.on_frame(&gateway, body).await;
    }
    writer.abort();

    if let Some(gateway) = registered {
        let owned = {
            let mut gateways = gateways.write().await;
            let owned = gateways
                .get(&gateway)
                .is_some_and(|entry| entry.connection_id == connection_id);
            if owned {
                gateways.remove(&gateway);
            }
            owned
        };
        if owned {
            info!(target: "gw.tcp", gateway = %gateway, "gateway_disconnected");
            handler.on_gateway_closed(&gateway).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn frames_carry_eui_and_body() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        let mut frame = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
        frame.extend_from_slice(br#"{"deviceKey":"lora-1"}"#);
        codec
            .encode(Bytes::from(frame.clone()), &mut wire)
            .expect("encode");
        assert_eq!(&wire[..2], &(frame.len() as u16).to_be_bytes());

        let decoded = codec.decode(&mut wire).expect("decode").expect("frame");
        let (gateway, body) = split_frame(&decoded).expect("split");
        assert_eq!(gateway, "0011223344556677");
        assert_eq!(body, br#"{"deviceKey":"lora-1"}"#);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(split_frame(&[1, 2, 3]).is_none());
    }
}
