//! MQTT 会话管理：clientId ↔ 连接双向映射，服务端主动下发。
//!
//! 约定 clientId 即 deviceKey。

use super::packet::{Packet, Publish};
use async_trait::async_trait;
use gw_driver::DeviceDownlink;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 发往连接任务的指令。
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    /// 关闭连接（会话被接管或服务端断开）
    Close,
}

#[derive(Debug, Clone)]
struct SessionHandle {
    connection_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Default)]
struct SessionState {
    by_client: HashMap<String, SessionHandle>,
    by_connection: HashMap<String, String>,
    /// 以 cleanSession=false 建立过会话的 clientId
    persistent: HashSet<String>,
}

#[derive(Debug)]
pub struct SessionManager {
    state: RwLock<SessionState>,
    next_packet_id: AtomicU16,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::default()),
            next_packet_id: AtomicU16::new(1),
        }
    }

    /// 登记新连接，返回 CONNACK 的 sessionPresent。
    ///
    /// 同一 clientId 的旧连接先被关闭；cleanSession 丢弃之前保留的会话状态。
    pub fn register(
        &self,
        client_id: &str,
        connection_id: &str,
        clean_session: bool,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        let Ok(mut state) = self.state.write() else {
            warn!(target: "gw.mqtt", client_id, "session_lock_failed");
            return false;
        };
        if let Some(previous) = state.by_client.remove(client_id) {
            state.by_connection.remove(&previous.connection_id);
            let _ = previous.tx.send(Outbound::Close);
            info!(
                target: "gw.mqtt",
                client_id,
                previous_connection = %previous.connection_id,
                "session_taken_over"
            );
        }
        let had_session = state.persistent.contains(client_id);
        if clean_session {
            state.persistent.remove(client_id);
        } else {
            state.persistent.insert(client_id.to_string());
        }
        state.by_client.insert(
            client_id.to_string(),
            SessionHandle {
                connection_id: connection_id.to_string(),
                tx,
            },
        );
        state
            .by_connection
            .insert(connection_id.to_string(), client_id.to_string());
        had_session && !clean_session
    }

    /// 连接结束时移除；会话已被新连接接管时返回 None。
    pub fn remove_connection(&self, connection_id: &str) -> Option<String> {
        let mut state = self.state.write().ok()?;
        let client_id = state.by_connection.remove(connection_id)?;
        let owned = state
            .by_client
            .get(&client_id)
            .is_some_and(|handle| handle.connection_id == connection_id);
        if owned {
            state.by_client.remove(&client_id);
            Some(client_id)
        } else {
            None
        }
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.state
            .read()
            .map(|state| state.by_client.contains_key(client_id))
            .unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        self.state
            .read()
            .map(|state| state.by_client.len())
            .unwrap_or(0)
    }

    pub fn online_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .state
            .read()
            .map(|state| state.by_client.keys().cloned().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    fn sender(&self, client_id: &str) -> Option<mpsc::UnboundedSender<Outbound>> {
        self.state
            .read()
            .ok()?
            .by_client
            .get(client_id)
            .map(|handle| handle.tx.clone())
    }

    fn allocate_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// 服务端主动 PUBLISH（QoS 1）。
    pub fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> bool {
        let Some(tx) = self.sender(client_id) else {
            debug!(target: "gw.mqtt", client_id, topic, "publish_target_offline");
            return false;
        };
        let packet_id = self.allocate_packet_id();
        let publish = Publish::new(topic, 1, Some(packet_id), payload.to_vec());
        tx.send(Outbound::Packet(Packet::Publish(publish))).is_ok()
    }

    /// 关闭指定客户端连接。
    pub fn close(&self, client_id: &str) -> bool {
        match self.sender(client_id) {
            Some(tx) => tx.send(Outbound::Close).is_ok(),
            None => false,
        }
    }

    pub fn close_all(&self) {
        if let Ok(state) = self.state.read() {
            for handle in state.by_client.values() {
                let _ = handle.tx.send(Outbound::Close);
            }
        }
    }
}

#[async_trait]
impl DeviceDownlink for SessionManager {
    async fn send_to_device(&self, device_key: &str, topic: &str, payload: &[u8]) -> bool {
        self.publish(device_key, topic, payload)
    }

    fn is_connected(&self, device_key: &str) -> bool {
        self.is_online(device_key)
    }

    async fn disconnect(&self, device_key: &str) {
        self.close(device_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takeover_closes_previous_connection() {
        let sessions = SessionManager::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        assert!(!sessions.register("dev-1", "c1", true, old_tx));
        assert!(!sessions.register("dev-1", "c2", true, new_tx));
        assert!(matches!(old_rx.try_recv(), Ok(Outbound::Close)));

        // 旧连接退出不影响新会话
        assert_eq!(sessions.remove_connection("c1"), None);
        assert!(sessions.is_online("dev-1"));
        assert_eq!(sessions.online_count(), 1);
        assert_eq!(sessions.remove_connection("c2"), Some("dev-1".to_string()));
        assert_eq!(sessions.online_count(), 0);
    }

    #[test]
    fn session_present_only_for_resumed_persistent_sessions() {
        let sessions = SessionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!sessions.register("dev-1", "c1", false, tx.clone()));
        sessions.remove_connection("c1");
        assert!(sessions.register("dev-1", "c2", false, tx.clone()));
        sessions.remove_connection("c2");
        assert!(!sessions.register("dev-1", "c3", true, tx.clone()));
        sessions.remove_connection("c3");
        assert!(!sessions.register("dev-1", "c4", false, tx));
    }

    #[test]
    fn publish_uses_qos1_with_nonzero_ids() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.register("dev-1", "c1", true, tx);
        assert!(sessions.publish("dev-1", "/p/dev-1/command/down", b"{}"));
        assert!(!sessions.publish("dev-2", "/p/dev-2/command/down", b"{}"));
        match rx.try_recv() {
            Ok(Outbound::Packet(Packet::Publish(publish))) => {
                assert_eq!(publish.qos, 1);
                assert_ne!(publish.packet_id, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
