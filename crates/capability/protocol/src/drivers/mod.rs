//! 内置协议驱动。
//!
//! 每个驱动导出一个 `DESCRIPTOR`（类型标签、显示名、构造函数、配置字段），
//! 进程初始化时由 `register_builtin_drivers` 显式登记到注册表。

pub mod custom;
pub mod dtu;
mod gateway_link;
pub mod http;
pub mod lora;
pub mod modbus;
pub mod mqtt;
pub mod opcua;
pub mod s7;
pub mod tcp_direct;
pub mod udp;
pub mod zigbee;

use crate::error::ProtocolError;
use domain::{DataMap, Device};
use futures_util::StreamExt;
use gw_driver::{DriverContext, DriverRegistry};
use serde_json::Value;
use std::sync::Mutex;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// 行协议单行上限（字节）
pub(crate) const MAX_LINE_LEN: usize = 64 * 1024;

pub(crate) type LineReader<R> = FramedRead<R, LinesCodec>;

pub(crate) fn line_reader<R: AsyncRead>(reader: R) -> LineReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN))
}

/// 读取下一行；对端关闭返回 `None`，超长行返回错误。
pub(crate) async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut LineReader<R>,
) -> Result<Option<String>, ProtocolError> {
    match lines.next().await {
        None => Ok(None),
        Some(Ok(line)) => Ok(Some(line)),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(ProtocolError::DataParse(
            format!("line exceeds {MAX_LINE_LEN} bytes"),
        )),
        Some(Err(LinesCodecError::Io(err))) => Err(err.into()),
    }
}

pub use custom::CustomDriver;
pub use dtu::DtuGatewayDriver;
pub use http::HttpDriver;
pub use lora::LoraGatewayDriver;
pub use modbus::ModbusTcpDriver;
pub use mqtt::MqttDriver;
pub use opcua::OpcUaDriver;
pub use s7::S7Driver;
pub use tcp_direct::TcpDirectDriver;
pub use udp::UdpDirectDriver;
pub use zigbee::ZigbeeGatewayDriver;

/// 登记全部内置驱动。
pub fn register_builtin_drivers(registry: &mut DriverRegistry) {
    registry.register(dtu::DESCRIPTOR);
    registry.register(tcp_direct::DESCRIPTOR);
    registry.register(udp::DESCRIPTOR);
    registry.register(modbus::DESCRIPTOR);
    registry.register(mqtt::DESCRIPTOR);
    registry.register(http::DESCRIPTOR);
    registry.register(lora::DESCRIPTOR);
    registry.register(zigbee::DESCRIPTOR);
    registry.register(opcua::DESCRIPTOR);
    registry.register(custom::DESCRIPTOR);
    registry.register(s7::DESCRIPTOR);
}

/// 含全部内置驱动的注册表。
pub fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    register_builtin_drivers(&mut registry);
    registry
}

/// 驱动后台任务集合；停止时统一中止。
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub(crate) fn push(&self, handle: JoinHandle<()>) {
        match self.handles.lock() {
            Ok(mut handles) => {
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
            }
            Err(_) => handle.abort(),
        }
    }

    pub(crate) fn abort_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// 解析一行 JSON 对象；非对象或解析失败返回 None。
pub(crate) fn parse_object(raw: &[u8]) -> Option<DataMap> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// 按 deviceKey 找到设备后上报属性；设备不存在时丢弃。
pub(crate) async fn report_by_key(context: &DriverContext, device_key: &str, data: DataMap) {
    if data.is_empty() {
        return;
    }
    match context.devices.find_by_key(device_key).await {
        Ok(Some(device)) => context.sink.report_property(&device, data).await,
        Ok(None) => {
            debug!(target: "gw.driver", device_key, "report_device_unknown");
        }
        Err(err) => {
            warn!(target: "gw.driver", device_key, error = %err, "report_device_lookup_failed");
        }
    }
}

/// 驱动绑定的设备中跳过 DISABLE 状态的。
pub(crate) async fn active_devices(context: &DriverContext, driver_id: &str) -> Vec<Device> {
    match context.driver_devices(driver_id).await {
        Ok(devices) => devices
            .into_iter()
            .filter(|device| device.status != domain::DeviceStatus::Disable)
            .collect(),
        Err(err) => {
            warn!(target: "gw.driver", driver_id, error = %err, "driver_devices_load_failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_every_driver_type() {
        let registry = builtin_registry();
        assert_eq!(
            registry.driver_types(),
            vec![
                "CUSTOM",
                "DTU_GATEWAY",
                "HTTP",
                "LORA_GATEWAY",
                "MODBUS_TCP",
                "MQTT",
                "OPCUA",
                "S7",
                "TCP_DIRECT",
                "UDP_DIRECT",
                "ZIGBEE_GATEWAY",
            ]
        );
        for driver_type in registry.driver_types() {
            let fields = registry.config_fields(driver_type).unwrap_or_default();
            assert!(!fields.is_empty(), "{driver_type} has no config fields");
        }
    }

    #[tokio::test]
    async fn line_reader_splits_lines_and_rejects_oversized_ones() {
        let input: &[u8] = b"{\"temp\": 1}\r\nREG:dtu-1\n";
        let mut lines = line_reader(input);
        assert_eq!(next_line(&mut lines).await.expect("line").as_deref(), Some(r#"{"temp": 1}"#));
        assert_eq!(next_line(&mut lines).await.expect("line").as_deref(), Some("REG:dtu-1"));
        assert!(next_line(&mut lines).await.expect("eof").is_none());

        let mut flood = vec![b'x'; MAX_LINE_LEN + 1];
        flood.push(b'\n');
        let mut lines = line_reader(flood.as_slice());
        assert!(matches!(next_line(&mut lines).await, Err(ProtocolError::DataParse(_))));
    }

    #[test]
    fn parse_object_rejects_non_objects() {
        assert!(parse_object(br#"{"temp": 1}"#).is_some());
        assert!(parse_object(b"[1,2]").is_none());
        assert!(parse_object(b"HEARTBEAT").is_none());
    }
}
