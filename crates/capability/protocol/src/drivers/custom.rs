//! CUSTOM 驱动：编解码委托给按名称注册的 `CustomProtocolHandler`。
//!
//! 启动时按 `handlerName` 从插件注册表解析处理器并以 `customConfig` 初始化；
//! 每个设备持有一份上下文（设备级驱动配置），随编解码调用传给处理器。

use super::{active_devices, report_by_key};
use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField, FieldLevel, FieldType, command_down_topic};
use gw_driver::{
    CustomProtocolHandler, DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "CUSTOM";

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "自定义协议驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(CustomDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("handlerName", "处理器名称", FieldType::Text, FieldLevel::Driver)
            .required()
            .span(24)
            .tip("进程启动时注册的协议处理器名称"),
        DriverConfigField::new("customConfig", "自定义配置", FieldType::Textarea, FieldLevel::Driver)
            .span(24)
            .tip("JSON 格式，启动时传给处理器"),
    ]
}

/// `customConfig` 可以是对象，也可以是 JSON 文本。
fn custom_config(config: &DriverConfig) -> Result<DataMap, DriverError> {
    match config.get("customConfig") {
        None => Ok(DataMap::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(DataMap::new()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(DriverError::Config("customConfig must be a JSON object".to_string())),
            Err(err) => Err(DriverError::Config(format!("customConfig: {err}"))),
        },
        Some(other) => Err(DriverError::Config(format!("customConfig: unexpected {other}"))),
    }
}

pub struct CustomDriver {
    base: DriverBase,
    context: DriverContext,
    handler: RwLock<Option<Arc<dyn CustomProtocolHandler>>>,
    device_contexts: RwLock<HashMap<String, DataMap>>,
}

impl CustomDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        Self {
            base: DriverBase::new(config),
            context,
            handler: RwLock::new(None),
            device_contexts: RwLock::new(HashMap::new()),
        }
    }

    async fn handler(&self) -> Result<Arc<dyn CustomProtocolHandler>, DriverError> {
        self.handler
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::NotRunning(self.base.config().driver_id.clone()))
    }

    async fn device_context(&self, device_key: &str) -> Option<DataMap> {
        self.device_contexts.read().await.get(device_key).cloned()
    }

    pub async fn register_device(&self, device_key: &str, context: DataMap) {
        self.device_contexts
            .write()
            .await
            .insert(device_key.to_string(), context);
    }

    /// 设备原始字节 → 处理器解析 → 属性上报。
    pub async fn handle_received_data(&self, device_key: &str, raw: &[u8]) -> Result<(), DriverError> {
        let handler = self.handler().await?;
        let device_context = self.device_context(device_key).await;
        let data = handler.parse_data(device_key, raw, device_context.as_ref())?;
        debug!(target: "gw.driver", device_key, points = data.len(), "custom_data_parsed");
        report_by_key(&self.context, device_key, data).await;
        Ok(())
    }

    pub async fn status(&self) -> DataMap {
        let mut status = DataMap::new();
        status.insert("running".to_string(), json!(self.is_running()));
        status.insert(
            "devices".to_string(),
            json!(self.device_contexts.read().await.len()),
        );
        status.insert(
            "handlerName".to_string(),
            json!(self.base.config().get_str("handlerName")),
        );
        status
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let config = self.base.config();
        let name = config.require_str("handlerName").map_err(DriverError::Config)?;
        let handler = self
            .context
            .plugins
            .resolve(name)
            .ok_or_else(|| DriverError::Config(format!("custom handler not registered: {name}")))?;
        handler.init(&custom_config(config)?)?;

        let mut contexts = self.device_contexts.write().await;
        for device in active_devices(&self.context, &config.driver_id).await {
            contexts.insert(device.device_key.clone(), device.driver_config.clone());
        }
        info!(target: "gw.driver", handler = name, devices = contexts.len(), "custom_handler_ready");
        *self.handler.write().await = Some(handler);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        if let Some(handler) = self.handler.write().await.take() {
            handler.destroy();
        }
        self.device_contexts.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for CustomDriver {
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

    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        let handler = self.handler().await?;
        let device_context = self.device_context(device_key).await;
        handler.read_data(device_key, params, device_context.as_ref())
    }

    /// 处理器编码后经 MQTT 下行通道发往设备的指令 Topic。
    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let handler = self.handler().await?;
        let device_context = self.device_context(device_key).await;
        let payload = handler.encode_data(device_key, data, device_context.as_ref())?;
        let Some(downlink) = self.context.downlink.as_ref() else {
            warn!(target: "gw.driver", device_key, "custom_downlink_unavailable");
            return Ok(false);
        };
        let device = self.context.require_device(device_key).await?;
        let topic = command_down_topic(&device.product_key, &device.device_key);
        let sent = downlink.send_to_device(device_key, &topic, &payload).await;
        info!(target: "gw.driver", device_key, bytes = payload.len(), sent, "custom_data_sent");
        Ok(sent)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        match self.handler.read().await.as_ref() {
            Some(handler) => handler.is_online(device_key),
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

    fn config(value: Value) -> DriverConfig {
        DriverConfig::new(
            "drv-c",
            "custom",
            DRIVER_TYPE,
            value.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn custom_config_accepts_object_or_text() {
        let from_text = custom_config(&config(json!({"customConfig": "{\"scale\": 2}"})))
            .expect("text config");
        assert_eq!(from_text.get("scale"), Some(&json!(2)));

        let from_object =
            custom_config(&config(json!({"customConfig": {"scale": 3}}))).expect("object config");
        assert_eq!(from_object.get("scale"), Some(&json!(3)));

        assert!(custom_config(&config(json!({}))).expect("empty").is_empty());
        assert!(custom_config(&config(json!({"customConfig": "[1]"}))).is_err());
    }
}
