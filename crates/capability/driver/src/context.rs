//! 驱动运行上下文：注入给每个驱动实例的共享依赖。
//!
//! 驱动不持有接入服务或会话管理器的反向引用，只通过这里的两个接口协作：
//! - `DeviceMessageSink`：上行（认证、上下线、属性/事件上报）
//! - `DeviceDownlink`：下行（向 MQTT 会话推送）

use crate::custom::PluginRegistry;
use crate::error::DriverError;
use async_trait::async_trait;
use domain::{DataMap, Device};
use gw_storage::{DeviceStore, MappingStore};
use std::sync::Arc;
use std::time::Duration;

/// 设备上行消息接收方。
#[async_trait]
pub trait DeviceMessageSink: Send + Sync {
    /// 校验设备接入凭据（clientId = deviceKey，password = deviceSecret）
    async fn authenticate(&self, client_id: &str, username: &str, password: &str) -> bool;

    /// 设备上线：状态置 ONLINE 并推送
    async fn device_online(&self, device_key: &str, ip_address: Option<&str>);

    /// 设备离线：状态置 OFFLINE 并推送
    async fn device_offline(&self, device_key: &str);

    /// 按 Topic 分发设备消息
    async fn handle_device_message(&self, topic: &str, payload: &[u8]);

    async fn report_property(&self, device: &Device, data: DataMap);

    async fn report_event(&self, device: &Device, data: DataMap);
}

/// 设备下行通道。
#[async_trait]
pub trait DeviceDownlink: Send + Sync {
    /// 服务端主动 PUBLISH（QoS 1）；设备不在线返回 false
    async fn send_to_device(&self, device_key: &str, topic: &str, payload: &[u8]) -> bool;

    fn is_connected(&self, device_key: &str) -> bool;

    /// 断开设备会话
    async fn disconnect(&self, device_key: &str);
}

/// 空接收方（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopMessageSink;

#[async_trait]
impl DeviceMessageSink for NoopMessageSink {
    async fn authenticate(&self, _client_id: &str, _username: &str, _password: &str) -> bool {
        false
    }

    async fn device_online(&self, _device_key: &str, _ip_address: Option<&str>) {}

    async fn device_offline(&self, _device_key: &str) {}

    async fn handle_device_message(&self, _topic: &str, _payload: &[u8]) {}

    async fn report_property(&self, _device: &Device, _data: DataMap) {}

    async fn report_event(&self, _device: &Device, _data: DataMap) {}
}

/// 协议层调优参数。
#[derive(Debug, Clone)]
pub struct DriverTuning {
    pub modbus_pool_max: usize,
    pub modbus_pool_expire: Duration,
    pub modbus_pool_sweep: Duration,
    /// S7 连续失败多少次判定离线
    pub s7_max_fail_count: u32,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self {
            modbus_pool_max: 200,
            modbus_pool_expire: Duration::from_secs(30 * 60),
            modbus_pool_sweep: Duration::from_secs(10 * 60),
            s7_max_fail_count: 3,
        }
    }
}

/// 驱动上下文。
#[derive(Clone)]
pub struct DriverContext {
    pub devices: Arc<dyn DeviceStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub sink: Arc<dyn DeviceMessageSink>,
    pub downlink: Option<Arc<dyn DeviceDownlink>>,
    pub plugins: PluginRegistry,
    pub tuning: DriverTuning,
}

impl DriverContext {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        mappings: Arc<dyn MappingStore>,
        sink: Arc<dyn DeviceMessageSink>,
    ) -> Self {
        Self {
            devices,
            mappings,
            sink,
            downlink: None,
            plugins: PluginRegistry::new(),
            tuning: DriverTuning::default(),
        }
    }

    pub fn with_downlink(mut self, downlink: Arc<dyn DeviceDownlink>) -> Self {
        self.downlink = Some(downlink);
        self
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_tuning(mut self, tuning: DriverTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// 按 deviceKey 查找设备，不存在返回 NotFound。
    pub async fn require_device(&self, device_key: &str) -> Result<Device, DriverError> {
        self.devices
            .find_by_key(device_key)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("device {device_key}")))
    }

    /// 列出绑定到驱动的设备。
    pub async fn driver_devices(&self, driver_id: &str) -> Result<Vec<Device>, DriverError> {
        Ok(self.devices.list_by_driver(driver_id).await?)
    }
}
