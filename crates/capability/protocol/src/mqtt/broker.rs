//! MQTT 接入端点：每个连接一个任务，按报文驱动会话状态机。
//!
//! 连接流程：
//! 1. 首个报文必须是 CONNECT，版本不支持回 CONNACK 0x01 后断开
//! 2. 认证失败（含禁用设备）回 CONNACK 0x04 后断开
//! 3. 登记会话（同 clientId 旧连接被关闭），回 CONNACK 0x00，设备上线
//! 4. 处理 PUBLISH/SUBSCRIBE/UNSUBSCRIBE/PINGREQ，转发服务端下发
//! 5. DISCONNECT、空闲超时（1.5 倍 keep-alive）或连接关闭时设备离线

use super::packet::{MqttCodec, Packet, connack};
use super::session::{Outbound, SessionManager};
use crate::error::ProtocolError;
use futures_util::{SinkExt, StreamExt};
use gw_driver::DeviceMessageSink;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// 订阅统一授予的 QoS
const GRANTED_QOS: u8 = 1;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// 客户端 keep-alive 为 0 时使用的默认值（秒）
    pub default_keep_alive_secs: u16,
    /// 等待首个 CONNECT 的时间
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_keep_alive_secs: 60,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: 1024 * 1024,
        }
    }
}

/// keep-alive 的 1.5 倍作为空闲超时。
pub fn idle_timeout(keep_alive_secs: u16, default_secs: u16) -> Duration {
    let secs = if keep_alive_secs == 0 {
        default_secs
    } else {
        keep_alive_secs
    };
    Duration::from_millis(u64::from(secs) * 1500)
}

pub struct MqttBroker {
    sessions: Arc<SessionManager>,
    sink: Arc<dyn DeviceMessageSink>,
    config: BrokerConfig,
}

impl MqttBroker {
    pub fn new(
        sessions: Arc<SessionManager>,
        sink: Arc<dyn DeviceMessageSink>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            sessions,
            sink,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// TCP 接入循环。
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let local = listener.local_addr().ok();
        info!(target: "gw.mqtt", addr = ?local, "mqtt_listener_started");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(target: "gw.mqtt", peer = %peer, error = %err, "set_nodelay_failed");
                    }
                    let broker = Arc::clone(&self);
                    tokio::spawn(async move {
                        broker.handle_connection(stream, peer).await;
                    });
                }
                Err(err) => {
                    error!(target: "gw.mqtt", error = %err, "mqtt_accept_failed");
                }
            }
        }
    }

    /// 处理单个连接（TCP 或 WebSocket 桥接后的字节流）。
    pub async fn handle_connection<IO>(&self, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let connection_id = gw_telemetry::new_connection_id();
        let span = info_span!("mqtt_connection", connection_id = %connection_id, peer = %peer);
        async {
            let framed = Framed::new(io, MqttCodec::new(self.config.max_packet_size));
            match self.run_session(framed, &connection_id, peer).await {
                Ok(()) => debug!(target: "gw.mqtt", "mqtt_connection_closed"),
                Err(err) => warn!(target: "gw.mqtt", error = %err, "mqtt_connection_error"),
            }
            if let Some(client_id) = self.sessions.remove_connection(&connection_id) {
                info!(target: "gw.mqtt", client_id = %client_id, "mqtt_device_offline");
                self.sink.device_offline(&client_id).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn run_session<IO>(
        &self,
        mut framed: Framed<IO, MqttCodec>,
        connection_id: &str,
        peer: SocketAddr,
    ) -> Result<(), ProtocolError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let first = match timeout(self.config.connect_timeout, framed.next()).await {
            Ok(Some(packet)) => packet?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(ProtocolError::Timeout("waiting for CONNECT".to_string())),
        };
        let connect = match first {
            Packet::Connect(connect) => connect,
            other => {
                return Err(ProtocolError::Mqtt(format!(
                    "expected CONNECT, got {}",
                    other.name()
                )));
            }
        };

        if !connect.supported_version() {
            gw_telemetry::record_mqtt_reject();
            warn!(
                target: "gw.mqtt",
                client_id = %connect.client_id,
                protocol_level = connect.protocol_level,
                "mqtt_unsupported_version"
            );
            framed
                .send(Packet::ConnAck {
                    session_present: false,
                    return_code: connack::UNACCEPTABLE_PROTOCOL_VERSION,
                })
                .await?;
            return Ok(());
        }

        let username = connect.username.clone().unwrap_or_default();
        let password = connect
            .password
            .as_ref()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        if connect.client_id.is_empty()
            || !self
                .sink
                .authenticate(&connect.client_id, &username, &password)
                .await
        {
            gw_telemetry::record_mqtt_reject();
            warn!(target: "gw.mqtt", client_id = %connect.client_id, "mqtt_auth_failed");
            framed
                .send(Packet::ConnAck {
                    session_present: false,
                    return_code: connack::BAD_USERNAME_OR_PASSWORD,
                })
                .await?;
            return Ok(());
        }

        let client_id = connect.client_id.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session_present =
            self.sessions
                .register(&client_id, connection_id, connect.clean_session, tx);
        framed
            .send(Packet::ConnAck {
                session_present,
                return_code: connack::ACCEPTED,
            })
            .await?;
        gw_telemetry::record_mqtt_connect();
        info!(
            target: "gw.mqtt",
            client_id = %client_id,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            session_present,
            "mqtt_connected"
        );
        let ip = peer.ip().to_string();
        self.sink.device_online(&client_id, Some(ip.as_str())).await;

        let idle = idle_timeout(connect.keep_alive, self.config.default_keep_alive_secs);
        loop {
            tokio::select! {
                inbound = timeout(idle, framed.next()) => {
                    let packet = match inbound {
                        Ok(Some(packet)) => packet?,
                        Ok(None) => return Ok(()),
                        Err(_) => {
                            info!(target: "gw.mqtt", client_id = %client_id, "mqtt_idle_timeout");
                            return Ok(());
                        }
                    };
                    if !self.handle_packet(&mut framed, &client_id, packet).await? {
                        return Ok(());
                    }
                }
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Packet(packet)) => framed.send(packet).await?,
                    Some(Outbound::Close) | None => {
                        info!(target: "gw.mqtt", client_id = %client_id, "mqtt_connection_closed_by_server");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// 处理一个已认证连接的报文；返回 false 表示结束会话。
    async fn handle_packet<IO>(
        &self,
        framed: &mut Framed<IO, MqttCodec>,
        client_id: &str,
        packet: Packet,
    ) -> Result<bool, ProtocolError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match packet {
            Packet::Publish(publish) => {
                gw_telemetry::record_mqtt_publish();
                debug!(
                    target: "gw.mqtt",
                    client_id,
                    topic = %publish.topic,
                    qos = publish.qos,
                    bytes = publish.payload.len(),
                    "mqtt_publish_received"
                );
                self.sink
                    .handle_device_message(&publish.topic, &publish.payload)
                    .await;
                if publish.qos >= 1
                    && let Some(packet_id) = publish.packet_id
                {
                    framed.send(Packet::PubAck(packet_id)).await?;
                }
            }
            Packet::Subscribe { packet_id, filters } => {
                debug!(target: "gw.mqtt", client_id, filters = filters.len(), "mqtt_subscribe");
                framed
                    .send(Packet::SubAck {
                        packet_id,
                        return_codes: vec![GRANTED_QOS; filters.len()],
                    })
                    .await?;
            }
            Packet::Unsubscribe { packet_id, .. } => {
                framed.send(Packet::UnsubAck(packet_id)).await?;
            }
            Packet::PingReq => framed.send(Packet::PingResp).await?,
            Packet::Disconnect => {
                info!(target: "gw.mqtt", client_id, "mqtt_disconnect_received");
                return Ok(false);
            }
            Packet::Connect(_) => {
                return Err(ProtocolError::Mqtt("duplicate CONNECT".to_string()));
            }
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {}
            other => {
                debug!(target: "gw.mqtt", client_id, packet = other.name(), "mqtt_packet_ignored");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_one_and_a_half_keep_alive() {
        assert_eq!(idle_timeout(10, 60), Duration::from_secs(15));
        assert_eq!(idle_timeout(0, 60), Duration::from_secs(90));
    }
}
