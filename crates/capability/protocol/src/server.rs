//! 协议服务管理：按 ID 启停托管的接入监听（MQTT TCP、MQTT WebSocket）。
//!
//! 非 0 端口不允许被两个运行中的服务同时占用。

use crate::error::ProtocolError;
use crate::mqtt::{MqttBroker, websocket};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerKind {
    MqttTcp,
    MqttWebSocket,
}

/// 运行中服务的快照。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: String,
    pub kind: ServerKind,
    /// 请求绑定的地址
    pub requested: SocketAddr,
    /// 实际监听地址
    pub local_addr: SocketAddr,
}

struct HostedServer {
    info: ServerInfo,
    handle: JoinHandle<()>,
}

pub struct ProtocolServerManager {
    broker: Arc<MqttBroker>,
    servers: Mutex<HashMap<String, HostedServer>>,
}

impl ProtocolServerManager {
    pub fn new(broker: Arc<MqttBroker>) -> Self {
        Self {
            broker,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<MqttBroker> {
        &self.broker
    }

    /// 启动服务，返回实际监听地址。
    pub async fn start(
        &self,
        id: &str,
        kind: ServerKind,
        addr: SocketAddr,
    ) -> Result<SocketAddr, ProtocolError> {
        let mut servers = self.servers.lock().await;
        if servers.contains_key(id) {
            return Err(ProtocolError::Connection(format!("server {id} already running")));
        }
        if addr.port() != 0
            && let Some(existing) = servers
                .values()
                .find(|server| server.info.local_addr.port() == addr.port())
        {
            warn!(target: "gw.mqtt", server_id = id, port = addr.port(), holder = %existing.info.id, "server_port_conflict");
            return Err(ProtocolError::Connection(format!(
                "port {} already used by server {}",
                addr.port(),
                existing.info.id
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let broker = Arc::clone(&self.broker);
        let handle = match kind {
            ServerKind::MqttTcp => tokio::spawn(broker.serve(listener)),
            ServerKind::MqttWebSocket => tokio::spawn(websocket::serve(broker, listener)),
        };
        info!(target: "gw.mqtt", server_id = id, kind = ?kind, addr = %local_addr, "server_started");
        servers.insert(
            id.to_string(),
            HostedServer {
                info: ServerInfo {
                    id: id.to_string(),
                    kind,
                    requested: addr,
                    local_addr,
                },
                handle,
            },
        );
        Ok(local_addr)
    }

    /// 停止服务；已建立的会话不受影响。
    pub async fn stop(&self, id: &str) -> bool {
        let removed = self.servers.lock().await.remove(id);
        match removed {
            Some(server) => {
                server.handle.abort();
                // 等待任务结束，监听端口随之释放
                let _ = server.handle.await;
                info!(target: "gw.mqtt", server_id = id, "server_stopped");
                true
            }
            None => false,
        }
    }

    /// 按原请求地址重启。
    pub async fn restart(&self, id: &str) -> Result<SocketAddr, ProtocolError> {
        let info = self
            .info(id)
            .await
            .ok_or_else(|| ProtocolError::Connection(format!("server {id} not running")))?;
        self.stop(id).await;
        // 0 端口沿用上次实际端口
        let addr = if info.requested.port() == 0 {
            info.local_addr
        } else {
            info.requested
        };
        self.start(id, info.kind, addr).await
    }

    pub async fn info(&self, id: &str) -> Option<ServerInfo> {
        self.servers
            .lock()
            .await
            .get(id)
            .map(|server| server.info.clone())
    }

    pub async fn running(&self) -> Vec<ServerInfo> {
        let mut servers: Vec<ServerInfo> = self
            .servers
            .lock()
            .await
            .values()
            .map(|server| server.info.clone())
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub async fn stop_all(&self) {
        let servers: Vec<(String, HostedServer)> = self.servers.lock().await.drain().collect();
        for (id, server) in servers {
            server.handle.abort();
            let _ = server.handle.await;
            info!(target: "gw.mqtt", server_id = %id, "server_stopped");
        }
    }
}
