//! OPCUA 驱动骨架：登记设备与节点映射，尚未建立 OPC UA 会话。
//!
//! 读写返回 `Unsupported`，在线状态始终为 false。

use super::active_devices;
use async_trait::async_trait;
use domain::{DataMap, Device, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const DRIVER_TYPE: &str = "OPCUA";
pub const DEFAULT_POLLING_MS: u64 = 5000;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "OPC UA驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(OpcUaDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("pollingInterval", "采集间隔(毫秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_POLLING_MS))
            .range(100, 60000),
        DriverConfigField::new("timeout", "超时时间(毫秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(5000)),
        DriverConfigField::new("serverUrl", "服务器地址", FieldType::Text, FieldLevel::Device)
            .required()
            .span(24)
            .tip("例如 opc.tcp://192.168.1.10:4840"),
        DriverConfigField::new("username", "用户名", FieldType::Text, FieldLevel::Device),
        DriverConfigField::new("password", "密码", FieldType::Password, FieldLevel::Device),
        DriverConfigField::new("pollingInterval", "采集间隔(毫秒)", FieldType::Number, FieldLevel::Device)
            .range(100, 60000),
    ]
}

/// 设备的 OPC UA 端点与属性 → nodeId 映射。
#[derive(Debug, Clone, PartialEq)]
pub struct OpcUaEndpoint {
    pub server_url: String,
    pub nodes: HashMap<String, String>,
}

impl OpcUaEndpoint {
    /// `serverUrl` 必填；`nodeIds` 为 `{属性标识: nodeId}`。
    pub fn from_device(device: &Device) -> Option<Self> {
        let server_url = device.config_str("serverUrl")?.to_string();
        let nodes = device
            .driver_config
            .get("nodeIds")
            .and_then(|value| value.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(key, node)| node.as_str().map(|node| (key.clone(), node.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { server_url, nodes })
    }
}

pub struct OpcUaDriver {
    base: DriverBase,
    context: DriverContext,
    endpoints: RwLock<HashMap<String, OpcUaEndpoint>>,
}

impl OpcUaDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        Self {
            base: DriverBase::new(config),
            context,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub async fn endpoint(&self, device_key: &str) -> Option<OpcUaEndpoint> {
        self.endpoints.read().await.get(device_key).cloned()
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let mut endpoints = self.endpoints.write().await;
        for device in active_devices(&self.context, &self.base.config().driver_id).await {
            match OpcUaEndpoint::from_device(&device) {
                Some(endpoint) => {
                    endpoints.insert(device.device_key.clone(), endpoint);
                }
                None => {
                    warn!(target: "gw.driver", device_key = %device.device_key, "opcua_server_url_missing");
                }
            }
        }
        info!(target: "gw.driver", devices = endpoints.len(), "opcua_devices_registered");
        Ok(())
    }

    fn unsupported(&self, device_key: &str) -> DriverError {
        DriverError::Unsupported(format!("opc ua session not established for {device_key}"))
    }
}

#[async_trait]
impl DeviceDriver for OpcUaDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.base.start_with(|| self.on_start()).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.base
            .stop_with(|| async {
                self.endpoints.write().await.clear();
                Ok(())
            })
            .await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    async fn read_data(&self, device_key: &str, _params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        Err(self.unsupported(device_key))
    }

    async fn write_data(&self, device_key: &str, _data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        Err(self.unsupported(device_key))
    }

    async fn is_device_online(&self, _device_key: &str) -> bool {
        false
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_reads_server_and_nodes() {
        let mut device = Device::new("d-1", "opc-1", "p-1");
        assert!(OpcUaEndpoint::from_device(&device).is_none());
        device.driver_config.insert("serverUrl".to_string(), json!("opc.tcp://plc:4840"));
        device
            .driver_config
            .insert("nodeIds".to_string(), json!({"temp": "ns=2;s=Temp", "bad": 1}));
        let endpoint = OpcUaEndpoint::from_device(&device).expect("endpoint");
        assert_eq!(endpoint.server_url, "opc.tcp://plc:4840");
        assert_eq!(endpoint.nodes.len(), 1);
        assert_eq!(endpoint.nodes.get("temp").map(String::as_str), Some("ns=2;s=Temp"));
    }
}
