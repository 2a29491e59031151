//! 驱动配置、运行状态与配置字段描述。

use crate::DataMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 驱动配置（实例化后不可变）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub driver_id: String,
    pub driver_name: String,
    /// 驱动类型标签，如 `MODBUS_TCP`、`S7`
    pub driver_type: String,
    #[serde(default)]
    pub config: DataMap,
}

impl DriverConfig {
    pub fn new(
        driver_id: impl Into<String>,
        driver_name: impl Into<String>,
        driver_type: impl Into<String>,
        config: DataMap,
    ) -> Self {
        Self {
            driver_id: driver_id.into(),
            driver_name: driver_name.into(),
            driver_type: driver_type.into(),
            config,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// 必填字符串配置；缺失时返回错误描述。
    pub fn require_str(&self, key: &str) -> Result<&str, String> {
        self.get_str(key)
            .ok_or_else(|| format!("missing required config: {key}"))
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    /// 整数配置，兼容 `"502"` 这样的字符串。
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64)),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
        self.get_i64(key)
            .and_then(|value| u64::try_from(value).ok())
            .unwrap_or(default)
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get_i64(key).and_then(|value| u16::try_from(value).ok())
    }

    pub fn get_u16_or(&self, key: &str, default: u16) -> u16 {
        self.get_u16(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(flag) => Some(*flag),
            Value::String(text) => Some(matches!(text.as_str(), "1" | "true" | "on")),
            Value::Number(number) => number.as_i64().map(|value| value != 0),
            _ => None,
        }
    }

    pub fn get_object(&self, key: &str) -> Option<&DataMap> {
        self.get(key).and_then(|value| value.as_object())
    }
}

/// 驱动持久化状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Running,
    #[default]
    Stopped,
    Error,
}

/// 驱动审计日志类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverLogType {
    Start,
    Stop,
    Error,
}

/// 配置字段输入类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Password,
    Select,
    Switch,
    Textarea,
}

/// 配置字段作用层级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldLevel {
    /// 驱动级（所有设备共享）
    Driver,
    /// 设备级（每个设备单独配置）
    Device,
}

/// 驱动配置字段描述（前端据此渲染配置表单）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfigField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub default_value: Option<Value>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub options: Vec<String>,
    pub placeholder: String,
    pub tip: String,
    pub span: u8,
    pub level: FieldLevel,
    pub required: bool,
}

impl DriverConfigField {
    pub fn new(key: &str, label: &str, field_type: FieldType, level: FieldLevel) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            field_type,
            default_value: None,
            min: None,
            max: None,
            options: Vec::new(),
            placeholder: String::new(),
            tip: String::new(),
            span: 12,
            level,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|item| item.to_string()).collect();
        self
    }

    pub fn tip(mut self, tip: &str) -> Self {
        self.tip = tip.to_string();
        self
    }

    pub fn span(mut self, span: u8) -> Self {
        self.span = span;
        self
    }
}
