//! 设备身份与状态。

use crate::DataMap;
use serde::{Deserialize, Serialize};

/// 设备状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// 已注册但从未上线
    #[default]
    Inactive,
    Online,
    Offline,
    /// 已禁用（禁止接入）
    Disable,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Disable => "DISABLE",
        }
    }

    /// 连接成功后是否需要切换为 ONLINE。
    pub fn should_activate(&self) -> bool {
        matches!(self, Self::Inactive | Self::Offline)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备记录（由上游配置协作方提供）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    /// 设备唯一标识（租户内唯一，不复用）
    pub device_key: String,
    #[serde(default)]
    pub device_name: String,
    /// MQTT 接入密钥
    #[serde(default)]
    pub device_secret: String,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub product_key: String,
    /// 绑定的驱动 ID
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub active_time_ms: Option<i64>,
    #[serde(default)]
    pub last_online_time_ms: Option<i64>,
    /// 设备级驱动配置（host/port/slaveAddress/rack/slot 等）
    #[serde(default)]
    pub driver_config: DataMap,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        device_key: impl Into<String>,
        product_key: impl Into<String>,
    ) -> Self {
        let product_key = product_key.into();
        Self {
            id: id.into(),
            device_key: device_key.into(),
            device_name: String::new(),
            device_secret: String::new(),
            product_id: product_key.clone(),
            product_key,
            driver_id: None,
            status: DeviceStatus::Inactive,
            ip_address: None,
            active_time_ms: None,
            last_online_time_ms: None,
            driver_config: DataMap::new(),
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.driver_config.get(key).and_then(|value| value.as_str())
    }

    /// 读取整数配置（兼容字符串形式的数字）。
    pub fn config_i64(&self, key: &str) -> Option<i64> {
        match self.driver_config.get(key)? {
            serde_json::Value::Number(number) => number.as_i64(),
            serde_json::Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        match self.driver_config.get(key)? {
            serde_json::Value::Bool(flag) => Some(*flag),
            serde_json::Value::String(text) => Some(matches!(text.as_str(), "1" | "true" | "on")),
            _ => None,
        }
    }

    /// 标记上线：状态改为 ONLINE，记录最近上线时间，首次上线记录激活时间。
    pub fn mark_online(&mut self, now_ms: i64) {
        self.status = DeviceStatus::Online;
        self.last_online_time_ms = Some(now_ms);
        if self.active_time_ms.is_none() {
            self.active_time_ms = Some(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_online_keeps_first_activation_time() {
        let mut device = Device::new("d-1", "dev-1", "prod-1");
        device.mark_online(1_000);
        device.status = DeviceStatus::Offline;
        device.mark_online(2_000);
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.active_time_ms, Some(1_000));
        assert_eq!(device.last_online_time_ms, Some(2_000));
    }

    #[test]
    fn config_i64_accepts_string_numbers() {
        let mut device = Device::new("d-1", "dev-1", "prod-1");
        device
            .driver_config
            .insert("port".to_string(), serde_json::json!("1502"));
        device
            .driver_config
            .insert("slaveAddress".to_string(), serde_json::json!(3));
        assert_eq!(device.config_i64("port"), Some(1502));
        assert_eq!(device.config_i64("slaveAddress"), Some(3));
        assert_eq!(device.config_i64("missing"), None);
    }
}
