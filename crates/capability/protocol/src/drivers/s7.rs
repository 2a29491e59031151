//! S7 驱动：每个设备一个采集任务，写入按映射地址编码。

use super::active_devices;
use crate::error::ProtocolError;
use crate::s7::client::DEFAULT_IO_TIMEOUT;
use crate::s7::poller::{self, DEFAULT_INTERVAL_MS};
use crate::s7::{S7Address, S7Client, S7Endpoint, S7Poller, S7Width, data_util};
use async_trait::async_trait;
use domain::{
    DataMap, DataType, Device, DriverConfig, DriverConfigField, FieldLevel, FieldType,
    PropertyMapping,
};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "S7";

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "西门子S7驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(S7Driver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new(
            "defaultPollingInterval",
            "默认采集间隔(毫秒)",
            FieldType::Number,
            FieldLevel::Driver,
        )
        .default_value(json!(DEFAULT_INTERVAL_MS))
        .range(1000, 60000)
        .span(24),
        DriverConfigField::new("timeout", "超时时间(毫秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(5000))
            .range(1000, 30000),
        DriverConfigField::new("host", "PLC IP地址", FieldType::Text, FieldLevel::Device).required(),
        DriverConfigField::new("port", "端口", FieldType::Number, FieldLevel::Device)
            .default_value(json!(102))
            .range(1, 65535),
        DriverConfigField::new("rack", "机架号", FieldType::Number, FieldLevel::Device)
            .default_value(json!(0))
            .range(0, 7),
        DriverConfigField::new("slot", "槽号", FieldType::Number, FieldLevel::Device)
            .default_value(json!(2))
            .range(0, 31)
            .tip("S7-300/400 一般为 2，S7-1200/1500 一般为 1"),
        DriverConfigField::new("interval", "采集间隔(毫秒)", FieldType::Number, FieldLevel::Device)
            .default_value(json!(DEFAULT_INTERVAL_MS))
            .range(1000, 60000),
    ]
}

pub struct S7Driver {
    base: DriverBase,
    context: DriverContext,
    poller: S7Poller,
}

impl S7Driver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let io_timeout = config
            .get_i64("timeout")
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_IO_TIMEOUT);
        let default_interval = Duration::from_millis(
            config.get_u64_or("defaultPollingInterval", DEFAULT_INTERVAL_MS).max(1),
        );
        let client = Arc::new(S7Client::new(io_timeout));
        let poller = S7Poller::new(client, context.clone(), default_interval);
        Self {
            base: DriverBase::new(config),
            context,
            poller,
        }
    }

    fn client(&self) -> &Arc<S7Client> {
        self.poller.client()
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let devices = active_devices(&self.context, &self.base.config().driver_id).await;
        let count = devices.len();
        for device in devices {
            self.poller.add_device(device).await;
        }
        info!(target: "gw.s7", driver_id = %self.base.config().driver_id, devices = count, "s7_polling_started");
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.poller.stop().await;
        Ok(())
    }

    async fn ensure_connected(&self, device: &Device) -> Result<(), ProtocolError> {
        if !self.client().is_connected(&device.id).await {
            let endpoint = S7Endpoint::from_device(device)?;
            self.client().connect(&device.id, &endpoint).await?;
        }
        Ok(())
    }

    /// 写一个地址；位地址先读出所在字节再回写。
    async fn write_address(
        &self,
        device_id: &str,
        address: &S7Address,
        value: &Value,
        data_type: DataType,
    ) -> Result<bool, ProtocolError> {
        let client = self.client();
        let payload = if address.width == S7Width::Bit {
            let bit = address.bit.unwrap_or(0);
            let flag = match value {
                Value::Bool(flag) => *flag,
                Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
                Value::String(text) => matches!(text.as_str(), "1" | "true" | "on"),
                _ => false,
            };
            let mut current = client.read_address(device_id, address, 1).await?;
            if current.is_empty() {
                current.push(0);
            }
            data_util::set_bool(&mut current, 0, bit, flag);
            current[..1].to_vec()
        } else {
            let width_type = match address.width {
                S7Width::Byte => DataType::Byte,
                S7Width::Word if data_type == DataType::Int => DataType::Int,
                S7Width::Word => DataType::Word,
                S7Width::DWord if data_type == DataType::Float => DataType::Float,
                S7Width::DWord => DataType::Dint,
                S7Width::Bit => DataType::Bool,
            };
            data_util::encode_value(value, width_type).ok_or_else(|| {
                ProtocolError::DataParse(format!("cannot encode {value} for {address}"))
            })?
        };
        client
            .write_area(device_id, address.area, address.db, address.byte_offset, &payload)
            .await
    }
}

/// 属性值还原为 PLC 原始值：`(value - offset) / scale`。
fn unscale(mapping: &PropertyMapping, value: &Value) -> Value {
    let Some(number) = value.as_f64().filter(|_| mapping.data_type != DataType::Bool) else {
        return value.clone();
    };
    let mut raw = number - mapping.offset.unwrap_or(0.0);
    if let Some(scale) = mapping.scale.filter(|scale| *scale != 0.0) {
        raw /= scale;
    }
    json!(raw)
}

#[async_trait]
impl DeviceDriver for S7Driver {
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

    /// 无参数时读取全部映射；`{"address": "DB1.DBW100", "size": 2}` 读取原始字节。
    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        self.ensure_connected(&device).await?;

        if let Some(text) = params.get("address").and_then(Value::as_str) {
            let address: S7Address = text.parse()?;
            let size = params
                .get("size")
                .and_then(Value::as_u64)
                .and_then(|size| u16::try_from(size).ok())
                .unwrap_or(1);
            let bytes = self.client().read_address(&device.id, &address, size).await?;
            let mut data = DataMap::new();
            data.insert("address".to_string(), json!(address.to_string()));
            data.insert("bytes".to_string(), json!(bytes));
            return Ok(data);
        }

        let mappings = self.context.mappings.resolve(&device).await?;
        Ok(poller::collect(self.client(), &device.id, &mappings).await?)
    }

    /// 按映射标识写入，任一地址被 PLC 拒绝即返回 false。
    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let mappings = self.context.mappings.resolve(&device).await?;
        self.ensure_connected(&device).await?;

        let mut written = 0usize;
        for (identifier, value) in data {
            let Some(mapping) = mappings.iter().find(|m| &m.identifier == identifier) else {
                debug!(target: "gw.s7", device_key, identifier = %identifier, "s7_write_unmapped");
                continue;
            };
            let address: S7Address = mapping.address.parse()?;
            let raw = unscale(mapping, value);
            let accepted = self
                .write_address(&device.id, &address, &raw, mapping.data_type)
                .await?;
            if !accepted {
                warn!(target: "gw.s7", device_key, address = %address, "s7_write_rejected");
                return Ok(false);
            }
            written += 1;
        }
        info!(target: "gw.s7", device_key, points = written, "s7_write_succeeded");
        Ok(written > 0)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        match self.context.devices.find_by_key(device_key).await {
            Ok(Some(device)) => self.client().is_connected(&device.id).await,
            _ => false,
        }
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}
