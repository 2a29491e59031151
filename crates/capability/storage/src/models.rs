//! 数据模型
//!
//! 下游存储协作方接收的记录：
//! - 审计行：DeviceDataRecord（属性/事件/指令响应）
//! - 时序点：TimeSeriesPoint
//! - 驱动审计：DriverLogRecord

use domain::{DataMap, DriverLogType};
use serde::{Deserialize, Serialize};

/// 审计数据类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceDataType {
    Property,
    Event,
    CommandResponse,
}

/// 设备数据审计行 `{deviceId, dataType, key, value, timestamp}`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDataRecord {
    pub device_id: String,
    pub data_type: DeviceDataType,
    /// 事件类型或属性名
    pub key: Option<String>,
    /// 原始 JSON 文本
    pub value: String,
    pub ts_ms: i64,
}

/// 时序点（按设备与 measurement 组织）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub device_id: String,
    pub device_key: String,
    pub product_id: String,
    pub measurement: String,
    pub fields: DataMap,
    pub ts_ms: i64,
}

/// 驱动启停/错误审计。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLogRecord {
    pub driver_id: String,
    pub log_type: DriverLogType,
    pub content: String,
    /// 扩展信息 `{uptime, startTime}`
    pub ext: serde_json::Value,
    pub ts_ms: i64,
}
