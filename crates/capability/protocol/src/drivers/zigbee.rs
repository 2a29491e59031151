//! ZIGBEE_GATEWAY 驱动：Zigbee 协调器经 TCP 连入。
//!
//! 载荷 = 2 字节大端短地址 + JSON 数据。短地址 ↔ deviceKey 来自设备级配置
//! `shortAddr`，或由携带 `deviceKey` 的上行报文学习。ZDO 报文不解析。

use super::gateway_link::{FrameHandler, GatewayLink};
use super::{TaskSet, active_devices, parse_object, report_by_key};
use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "ZIGBEE_GATEWAY";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_PERMIT_JOIN_SECS: u8 = 60;
/// 协调器短地址
pub const COORDINATOR: u16 = 0x0000;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "Zigbee网关驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(ZigbeeGatewayDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("port", "监听端口", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_PORT))
            .range(1, 65535)
            .required(),
        DriverConfigField::new("channel", "信道", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(11))
            .range(11, 26),
        DriverConfigField::new("panId", "PAN ID", FieldType::Text, FieldLevel::Driver)
            .default_value(json!("0x1234")),
        DriverConfigField::new(
            "permitJoinDuration",
            "允许入网时长(秒)",
            FieldType::Number,
            FieldLevel::Driver,
        )
        .default_value(json!(DEFAULT_PERMIT_JOIN_SECS))
        .range(0, 255)
        .tip("0 表示禁止入网"),
        DriverConfigField::new("shortAddr", "短地址", FieldType::Text, FieldLevel::Device)
            .tip("如 0x1A2B"),
    ]
}

/// `0x1A2B` / `1A2B` / `6699` → 短地址。
pub fn parse_short_addr(text: &str) -> Option<u16> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => u16::from_str_radix(text, 16).ok(),
    }
}

pub fn format_short_addr(addr: u16) -> String {
    format!("0x{addr:04X}")
}

/// 载荷 → (短地址, JSON 数据)。
pub fn split_payload(body: &[u8]) -> Option<(u16, &[u8])> {
    if body.len() < 2 {
        return None;
    }
    let (addr, rest) = body.split_at(2);
    Some((u16::from_be_bytes([addr[0], addr[1]]), rest))
}

pub fn build_payload(short_addr: u16, json: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + json.len());
    body.extend_from_slice(&short_addr.to_be_bytes());
    body.extend_from_slice(json);
    body
}

#[derive(Debug, Default)]
struct Topology {
    /// 短地址 → deviceKey
    devices: HashMap<u16, String>,
    /// deviceKey → (网关 EUI, 短地址)
    routes: HashMap<String, (String, u16)>,
}

struct ZigbeeFrames {
    context: DriverContext,
    topology: Arc<RwLock<Topology>>,
}

#[async_trait]
impl FrameHandler for ZigbeeFrames {
    async fn on_frame(&self, gateway: &str, body: &[u8]) {
        let Some((short_addr, json)) = split_payload(body) else {
            debug!(target: "gw.tcp", gateway, "zigbee_payload_too_short");
            return;
        };
        let mut data = parse_object(json);
        let claimed = data
            .as_mut()
            .and_then(|data| data.remove("deviceKey"))
            .and_then(|value| match value {
                Value::String(key) if !key.is_empty() => Some(key),
                _ => None,
            });

        let (device_key, newly_routed) = {
            let mut topology = self.topology.write().await;
            let device_key = match claimed {
                Some(key) => {
                    topology.devices.insert(short_addr, key.clone());
                    key
                }
                None => match topology.devices.get(&short_addr) {
                    Some(key) => key.clone(),
                    None => {
                        debug!(
                            target: "gw.tcp",
                            gateway,
                            short_addr = %format_short_addr(short_addr),
                            "zigbee_address_unknown"
                        );
                        return;
                    }
                },
            };
            let route = (gateway.to_string(), short_addr);
            let previous = topology.routes.insert(device_key.clone(), route.clone());
            (device_key, previous != Some(route))
        };

        if newly_routed {
            info!(
                target: "gw.tcp",
                device_key = %device_key,
                gateway,
                short_addr = %format_short_addr(short_addr),
                "zigbee_device_routed"
            );
            self.context.sink.device_online(&device_key, None).await;
        }
        if let Some(data) = data {
            report_by_key(&self.context, &device_key, data).await;
        }
    }

    async fn on_gateway_closed(&self, gateway: &str) {
        let orphaned: Vec<String> = {
            let mut topology = self.topology.write().await;
            let keys: Vec<String> = topology
                .routes
                .iter()
                .filter(|(_, (via, _))| via.as_str() == gateway)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                topology.routes.remove(key);
            }
            keys
        };
        for device_key in orphaned {
            self.context.sink.device_offline(&device_key).await;
        }
    }
}

pub struct ZigbeeGatewayDriver {
    base: DriverBase,
    context: DriverContext,
    port: u16,
    permit_join_secs: u8,
    link: GatewayLink,
    topology: Arc<RwLock<Topology>>,
    tasks: TaskSet,
}

impl ZigbeeGatewayDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let port = config.get_u16_or("port", DEFAULT_PORT);
        let permit_join_secs = config
            .get_i64("permitJoinDuration")
            .and_then(|secs| u8::try_from(secs).ok())
            .unwrap_or(DEFAULT_PERMIT_JOIN_SECS);
        Self {
            base: DriverBase::new(config),
            context,
            port,
            permit_join_secs,
            link: GatewayLink::default(),
            topology: Arc::new(RwLock::new(Topology::default())),
            tasks: TaskSet::default(),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr().await
    }

    pub async fn register_device(&self, device_key: &str, short_addr: u16) {
        self.topology
            .write()
            .await
            .devices
            .insert(short_addr, device_key.to_string());
    }

    /// 向协调器下发允许入网指令；`seconds` 为 0 表示关闭入网。
    pub async fn permit_join(&self, gateway: &str, seconds: u8) -> bool {
        let command = json!({"cmd": "permitJoin", "duration": seconds});
        let body = build_payload(COORDINATOR, command.to_string().as_bytes());
        let sent = self.link.send(gateway, &body).await;
        info!(target: "gw.tcp", gateway, seconds, sent, "zigbee_permit_join");
        sent
    }

    pub fn default_permit_join(&self) -> u8 {
        self.permit_join_secs
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        for device in active_devices(&self.context, &self.base.config().driver_id).await {
            if let Some(addr) = device.config_str("shortAddr").and_then(parse_short_addr) {
                self.register_device(&device.device_key, addr).await;
            }
        }
        let handler = Arc::new(ZigbeeFrames {
            context: self.context.clone(),
            topology: Arc::clone(&self.topology),
        });
        let task = self.link.start(self.port, handler).await?;
        self.tasks.push(task);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        self.link.clear().await;
        let mut topology = self.topology.write().await;
        topology.devices.clear();
        topology.routes.clear();
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for ZigbeeGatewayDriver {
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
        Err(DriverError::Unsupported(
            "zigbee devices report through their coordinator".to_string(),
        ))
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let route = self.topology.read().await.routes.get(device_key).cloned();
        let Some((gateway, short_addr)) = route else {
            warn!(target: "gw.tcp", device_key, "zigbee_device_not_routed");
            return Ok(false);
        };
        let json = serde_json::to_vec(data).map_err(DriverError::transport)?;
        let sent = self.link.send(&gateway, &build_payload(short_addr, &json)).await;
        if sent {
            info!(
                target: "gw.tcp",
                device_key,
                gateway = %gateway,
                short_addr = %format_short_addr(short_addr),
                "zigbee_downlink_sent"
            );
        }
        Ok(sent)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        let route = self.topology.read().await.routes.get(device_key).cloned();
        match route {
            Some((gateway, _)) => self.link.is_connected(&gateway).await,
            None => false,
        }
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_address_forms() {
        assert_eq!(parse_short_addr("0x1A2B"), Some(0x1A2B));
        assert_eq!(parse_short_addr("1a2b"), Some(0x1A2B));
        assert_eq!(parse_short_addr("zz"), None);
        assert_eq!(format_short_addr(0x00FF), "0x00FF");
    }

    #[test]
    fn payload_prefixes_short_address() {
        let body = build_payload(0x1A2B, br#"{"on":true}"#);
        assert_eq!(&body[..2], &[0x1A, 0x2B]);
        let (addr, json) = split_payload(&body).expect("payload");
        assert_eq!(addr, 0x1A2B);
        assert_eq!(json, br#"{"on":true}"#);
        assert!(split_payload(&[0x01]).is_none());
    }
}
