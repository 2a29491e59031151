//! UDP_DIRECT 驱动：绑定本地端口收发数据报。
//!
//! 数据报按发送方地址归属到设备；未知地址的数据报若携带 `deviceKey` 则学习该地址。
//! 每 `heartbeatInterval` 秒向已知设备发送 `HEARTBEAT`。

use super::{TaskSet, active_devices, parse_object, report_by_key};
use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{DataMap, Device, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "UDP_DIRECT";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;
pub const HEARTBEAT: &[u8] = b"HEARTBEAT";
const MAX_DATAGRAM: usize = 65_507;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "UDP直连驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(UdpDirectDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("port", "监听端口", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_PORT))
            .range(1, 65535)
            .required(),
        DriverConfigField::new(
            "heartbeatInterval",
            "心跳间隔(秒)",
            FieldType::Number,
            FieldLevel::Driver,
        )
        .default_value(json!(DEFAULT_HEARTBEAT_SECS))
        .range(0, 3600)
        .tip("0 表示不发送心跳"),
        DriverConfigField::new("host", "设备IP", FieldType::Text, FieldLevel::Device),
        DriverConfigField::new("port", "设备端口", FieldType::Number, FieldLevel::Device)
            .range(1, 65535),
    ]
}

/// deviceKey ↔ 远端地址。
#[derive(Debug, Default)]
struct AddressBook {
    by_key: HashMap<String, SocketAddr>,
}

impl AddressBook {
    fn insert(&mut self, device_key: &str, addr: SocketAddr) -> bool {
        self.by_key.insert(device_key.to_string(), addr) != Some(addr)
    }

    fn key_of(&self, addr: &SocketAddr) -> Option<String> {
        self.by_key
            .iter()
            .find(|(_, known)| *known == addr)
            .map(|(key, _)| key.clone())
    }
}

pub struct UdpDirectDriver {
    base: DriverBase,
    context: DriverContext,
    port: u16,
    heartbeat: Duration,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    addresses: Arc<RwLock<AddressBook>>,
    tasks: TaskSet,
}

impl UdpDirectDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let port = config.get_u16_or("port", DEFAULT_PORT);
        let heartbeat =
            Duration::from_secs(config.get_u64_or("heartbeatInterval", DEFAULT_HEARTBEAT_SECS));
        Self {
            base: DriverBase::new(config),
            context,
            port,
            heartbeat,
            socket: RwLock::new(None),
            addresses: Arc::new(RwLock::new(AddressBook::default())),
            tasks: TaskSet::default(),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.read().await;
        socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub async fn register_device(&self, device_key: &str, addr: SocketAddr) {
        if self.addresses.write().await.insert(device_key, addr) {
            info!(target: "gw.udp", device_key, addr = %addr, "udp_device_registered");
        }
    }

    async fn register_configured(&self, device: &Device) {
        let (Some(host), Some(port)) = (device.config_str("host"), device.config_i64("port")) else {
            return;
        };
        let Ok(port) = u16::try_from(port) else {
            return;
        };
        match lookup_host((host, port)).await.map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => self.register_device(&device.device_key, addr).await,
            Ok(None) => {}
            Err(err) => {
                warn!(target: "gw.udp", device_key = %device.device_key, host, error = %err, "udp_resolve_failed");
            }
        }
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|err| DriverError::Transport(format!("bind udp port {}: {err}", self.port)))?;
        let socket = Arc::new(socket);
        info!(target: "gw.udp", addr = ?socket.local_addr().ok(), "udp_socket_bound");

        for device in active_devices(&self.context, &self.base.config().driver_id).await {
            self.register_configured(&device).await;
        }

        let receiver = Receiver {
            socket: Arc::clone(&socket),
            addresses: Arc::clone(&self.addresses),
            context: self.context.clone(),
        };
        self.tasks.push(tokio::spawn(receiver.run()));

        if !self.heartbeat.is_zero() {
            let socket = Arc::clone(&socket);
            let addresses = Arc::clone(&self.addresses);
            let period = self.heartbeat;
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let targets: Vec<SocketAddr> =
                        addresses.read().await.by_key.values().copied().collect();
                    for target in targets {
                        if let Err(err) = socket.send_to(HEARTBEAT, target).await {
                            debug!(target: "gw.udp", addr = %target, error = %err, "udp_heartbeat_failed");
                        }
                    }
                }
            }));
        }

        *self.socket.write().await = Some(socket);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        *self.socket.write().await = None;
        self.addresses.write().await.by_key.clear();
        Ok(())
    }
}

struct Receiver {
    socket: Arc<UdpSocket>,
    addresses: Arc<RwLock<AddressBook>>,
    context: DriverContext,
}

impl Receiver {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, sender)) => self.on_datagram(&buf[..len], sender).await,
                Err(err) => {
                    warn!(target: "gw.udp", error = %err, "udp_recv_failed");
                }
            }
        }
    }

    async fn on_datagram(&self, payload: &[u8], sender: SocketAddr) {
        if payload == HEARTBEAT {
            return;
        }
        let mut data = parse_object(payload);
        let claimed = data
            .as_mut()
            .and_then(|data| data.remove("deviceKey"))
            .and_then(|value| match value {
                Value::String(key) if !key.is_empty() => Some(key),
                _ => None,
            });

        let known = self.addresses.read().await.key_of(&sender);
        let device_key = match (known, claimed) {
            (Some(key), _) => key,
            (None, Some(key)) => {
                if self.addresses.write().await.insert(&key, sender) {
                    info!(target: "gw.udp", device_key = %key, addr = %sender, "udp_device_learned");
                    let ip = sender.ip().to_string();
                    self.context.sink.device_online(&key, Some(ip.as_str())).await;
                }
                key
            }
            (None, None) => {
                debug!(target: "gw.udp", addr = %sender, bytes = payload.len(), "udp_sender_unknown");
                return;
            }
        };
        match data {
            Some(data) => report_by_key(&self.context, &device_key, data).await,
            None => {
                debug!(target: "gw.udp", device_key = %device_key, bytes = payload.len(), "udp_payload_not_json");
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for UdpDirectDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.base.start_with(|| self.on_start()).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.base.stop_with(|| self.on_stop()).await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    async fn read_data(&self, _device_key: &str, _params: &DataMap) -> Result<DataMap, DriverError> {
        Err(DriverError::Unsupported("udp devices report data actively".to_string()))
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let Some(target) = self.addresses.read().await.by_key.get(device_key).copied() else {
            warn!(target: "gw.udp", device_key, "udp_device_address_unknown");
            return Ok(false);
        };
        let Some(socket) = self.socket.read().await.clone() else {
            return Err(DriverError::NotRunning(self.base.config().driver_id.clone()));
        };
        let payload = serde_json::to_vec(data).map_err(DriverError::transport)?;
        socket
            .send_to(&payload, target)
            .await
            .map_err(ProtocolError::from)?;
        info!(target: "gw.udp", device_key, addr = %target, bytes = payload.len(), "udp_data_sent");
        Ok(true)
    }

    /// 地址已知即视为在线。
    async fn is_device_online(&self, device_key: &str) -> bool {
        self.addresses.read().await.by_key.contains_key(device_key)
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_book_reverse_lookup() {
        let mut book = AddressBook::default();
        let addr: SocketAddr = "10.0.0.5:5001".parse().expect("addr");
        assert!(book.insert("udp-1", addr));
        assert!(!book.insert("udp-1", addr));
        assert_eq!(book.key_of(&addr), Some("udp-1".to_string()));
        let other: SocketAddr = "10.0.0.6:5001".parse().expect("addr");
        assert_eq!(book.key_of(&other), None);
    }
}
