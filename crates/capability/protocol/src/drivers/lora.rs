//! LORA_GATEWAY 驱动：LoRa 网关经 TCP 连入转发终端数据。
//!
//! 上行载荷为 `{"deviceKey": "...", "data": {...}}`；收到后记录终端所在网关并上报。
//! 只处理网关已解出的应用数据，不涉及 LoRaWAN MAC 层。

use super::gateway_link::{FrameHandler, GatewayLink};
use super::{TaskSet, parse_object, report_by_key};
use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "LORA_GATEWAY";
pub const DEFAULT_PORT: u16 = 7000;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "LoRa网关驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(LoraGatewayDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("port", "监听端口", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_PORT))
            .range(1, 65535)
            .required(),
        DriverConfigField::new("frequency", "频段(MHz)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(470)),
        DriverConfigField::new("spreadingFactor", "扩频因子", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(7))
            .range(7, 12),
        DriverConfigField::new("bandwidth", "带宽(kHz)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(7.8)),
    ]
}

/// 解析上行载荷：返回 deviceKey 与数据。
pub fn parse_uplink(body: &[u8]) -> Option<(String, DataMap)> {
    let mut object = parse_object(body)?;
    let key = match object.remove("deviceKey")? {
        Value::String(key) if !key.is_empty() => key,
        _ => return None,
    };
    let data = match object.remove("data") {
        Some(Value::Object(data)) => data,
        Some(other) => {
            let mut data = DataMap::new();
            data.insert("data".to_string(), other);
            data
        }
        None => object,
    };
    Some((key, data))
}

/// deviceKey → 网关 EUI。
type Routes = Arc<RwLock<HashMap<String, String>>>;

struct LoraFrames {
    context: DriverContext,
    routes: Routes,
}

#[async_trait]
impl FrameHandler for LoraFrames {
    async fn on_frame(&self, gateway: &str, body: &[u8]) {
        let Some((device_key, data)) = parse_uplink(body) else {
            debug!(target: "gw.tcp", gateway, bytes = body.len(), "lora_payload_invalid");
            return;
        };
        let previous = self
            .routes
            .write()
            .await
            .insert(device_key.clone(), gateway.to_string());
        if previous.as_deref() != Some(gateway) {
            info!(target: "gw.tcp", device_key = %device_key, gateway, "lora_device_routed");
            self.context.sink.device_online(&device_key, None).await;
        }
        report_by_key(&self.context, &device_key, data).await;
    }

    async fn on_gateway_closed(&self, gateway: &str) {
        let orphaned: Vec<String> = {
            let mut routes = self.routes.write().await;
            let keys: Vec<String> = routes
                .iter()
                .filter(|(_, via)| via.as_str() == gateway)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                routes.remove(key);
            }
            keys
        };
        for device_key in orphaned {
            self.context.sink.device_offline(&device_key).await;
        }
    }
}

pub struct LoraGatewayDriver {
    base: DriverBase,
    context: DriverContext,
    port: u16,
    link: GatewayLink,
    routes: Routes,
    tasks: TaskSet,
}

impl LoraGatewayDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let port = config.get_u16_or("port", DEFAULT_PORT);
        Self {
            base: DriverBase::new(config),
            context,
            port,
            link: GatewayLink::default(),
            routes: Arc::new(RwLock::new(HashMap::new())),
            tasks: TaskSet::default(),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr().await
    }

    /// 手动登记终端所在网关。
    pub async fn register_device(&self, device_key: &str, gateway: &str) {
        self.routes
            .write()
            .await
            .insert(device_key.to_string(), gateway.to_uppercase());
    }

    pub async fn gateways(&self) -> Vec<String> {
        self.link.gateways().await
    }

    async fn gateway_of(&self, device_key: &str) -> Option<String> {
        self.routes.read().await.get(device_key).cloned()
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let handler = Arc::new(LoraFrames {
            context: self.context.clone(),
            routes: Arc::clone(&self.routes),
        });
        let task = self.link.start(self.port, handler).await?;
        self.tasks.push(task);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        self.link.clear().await;
        self.routes.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for LoraGatewayDriver {
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
            "lora devices report through their gateway".to_string(),
        ))
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let Some(gateway) = self.gateway_of(device_key).await else {
            warn!(target: "gw.tcp", device_key, "lora_device_not_routed");
            return Ok(false);
        };
        let body = serde_json::to_vec(&json!({"deviceKey": device_key, "data": data}))
            .map_err(DriverError::transport)?;
        let sent = self.link.send(&gateway, &body).await;
        if sent {
            info!(target: "gw.tcp", device_key, gateway = %gateway, "lora_downlink_sent");
        }
        Ok(sent)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        match self.gateway_of(device_key).await {
            Some(gateway) => self.link.is_connected(&gateway).await,
            None => false,
        }
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}
