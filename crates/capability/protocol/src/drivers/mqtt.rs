//! MQTT 驱动：设备经内置 Broker 接入，驱动只负责下行与在线查询。

use async_trait::async_trait;
use domain::{
    DataMap, DriverConfig, DriverConfigField, FieldLevel, FieldType, command_down_topic,
};
use gw_driver::{
    DeviceDownlink, DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub const DRIVER_TYPE: &str = "MQTT";

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "MQTT驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(MqttDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("brokerUrl", "Broker地址", FieldType::Text, FieldLevel::Driver)
            .default_value(json!("tcp://localhost:1883"))
            .required(),
        DriverConfigField::new("port", "端口", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(1883))
            .range(1, 65535)
            .required(),
        DriverConfigField::new("topicPrefix", "Topic前缀", FieldType::Text, FieldLevel::Driver)
            .default_value(json!("/device")),
        DriverConfigField::new("qos", "QoS", FieldType::Select, FieldLevel::Driver)
            .default_value(json!(1))
            .options(&["0", "1", "2"]),
    ]
}

pub struct MqttDriver {
    base: DriverBase,
    context: DriverContext,
}

impl MqttDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        Self {
            base: DriverBase::new(config),
            context,
        }
    }

    fn downlink(&self) -> Result<&Arc<dyn DeviceDownlink>, DriverError> {
        self.context
            .downlink
            .as_ref()
            .ok_or_else(|| DriverError::Config("mqtt session manager not available".to_string()))
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        self.downlink()?;
        info!(
            target: "gw.mqtt",
            driver_id = %self.base.config().driver_id,
            "mqtt_driver_bound"
        );
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        let downlink = Arc::clone(self.downlink()?);
        let devices = self
            .context
            .driver_devices(&self.base.config().driver_id)
            .await?;
        for device in devices {
            if downlink.is_connected(&device.device_key) {
                downlink.disconnect(&device.device_key).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for MqttDriver {
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

    /// 设备主动上报，没有拉取语义。
    async fn read_data(&self, _device_key: &str, _params: &DataMap) -> Result<DataMap, DriverError> {
        Err(DriverError::Unsupported(
            "mqtt devices report data by publishing".to_string(),
        ))
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let topic = command_down_topic(&device.product_key, &device.device_key);
        let payload = serde_json::to_vec(data).map_err(DriverError::transport)?;
        let delivered = self
            .downlink()?
            .send_to_device(&device.device_key, &topic, &payload)
            .await;
        if !delivered {
            warn!(target: "gw.mqtt", device_key, topic = %topic, "mqtt_command_undelivered");
        }
        Ok(delivered)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        self.downlink()
            .map(|downlink| downlink.is_connected(device_key))
            .unwrap_or(false)
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}
