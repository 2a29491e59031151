//! 属性 ↔ 协议地址映射（寄存器映射）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 映射声明的数据类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Byte,
    /// 整数，缩放后四舍五入
    #[default]
    Int,
    Word,
    #[serde(alias = "dword")]
    Dint,
    #[serde(alias = "real")]
    Float,
    #[serde(alias = "lreal")]
    Double,
    String,
}

impl DataType {
    /// S7 读取时该类型占用的字节数。
    pub fn byte_size(&self) -> u16 {
        match self {
            Self::Bool | Self::Byte => 1,
            Self::Int | Self::Word => 2,
            Self::Dint | Self::Float => 4,
            Self::Double => 8,
            Self::String => 2,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Bool | Self::String)
    }
}

/// 单个属性的地址映射。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMapping {
    /// 属性标识（设备内唯一）
    pub identifier: String,
    /// 协议地址：Modbus 为寄存器地址，S7 为 `DB1.DBW100` 形式
    pub address: String,
    /// Modbus 功能码（如 `0x03`）；S7 映射为空
    #[serde(default)]
    pub function_code: Option<String>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub bit_index: Option<u8>,
}

impl PropertyMapping {
    pub fn new(identifier: &str, address: &str, data_type: DataType) -> Self {
        Self {
            identifier: identifier.to_string(),
            address: address.to_string(),
            function_code: None,
            data_type,
            scale: None,
            offset: None,
            bit_index: None,
        }
    }

    pub fn with_function_code(mut self, code: &str) -> Self {
        self.function_code = Some(code.to_string());
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = Some(scale);
        self.offset = Some(offset);
        self
    }

    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit_index = Some(bit);
        self
    }

    /// 数值地址（Modbus 映射使用），支持十进制与 `0x` 前缀。
    pub fn numeric_address(&self) -> Option<u16> {
        let text = self.address.trim();
        match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        }
    }

    /// 功能码数值；未声明时为 None。
    pub fn function_code_value(&self) -> Option<u8> {
        let text = self.function_code.as_deref()?.trim();
        match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        }
    }

    /// 将原始整数值转换为属性值。
    ///
    /// - bool 且声明了 bit_index：取 `(raw >> bit) & 1`
    /// - 数值类型：`raw * scale + offset`，int 四舍五入
    pub fn convert_raw(&self, raw: i64) -> Value {
        match self.data_type {
            DataType::Bool => {
                let bit = match self.bit_index {
                    Some(bit) => (raw >> bit) & 1,
                    None => raw,
                };
                Value::Bool(bit != 0)
            }
            DataType::String => Value::String(raw.to_string()),
            _ => self.convert_number(raw as f64),
        }
    }

    /// 将已解码的浮点数应用缩放与偏移。
    pub fn convert_number(&self, raw: f64) -> Value {
        let mut value = raw;
        if let Some(scale) = self.scale {
            value *= scale;
        }
        if let Some(offset) = self.offset {
            value += offset;
        }
        match self.data_type {
            DataType::Int | DataType::Byte | DataType::Word | DataType::Dint => {
                Value::from(value.round() as i64)
            }
            DataType::Bool => Value::Bool(value != 0.0),
            _ => serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

/// 合并设备级与产品级映射：设备级为空时继承产品级，同一 identifier 以设备级为准。
pub fn resolve_mappings(
    device_level: Vec<PropertyMapping>,
    product_level: Vec<PropertyMapping>,
) -> Vec<PropertyMapping> {
    if device_level.is_empty() {
        return product_level;
    }
    let mut resolved = device_level;
    for mapping in product_level {
        if !resolved
            .iter()
            .any(|item| item.identifier == mapping.identifier)
        {
            resolved.push(mapping);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_scale_and_offset() {
        let mapping = PropertyMapping::new("temp", "100", DataType::Float).with_scale(0.1, 0.0);
        assert_eq!(mapping.convert_raw(250), serde_json::json!(25.0));
    }

    #[test]
    fn int_rounds_after_scale() {
        let mapping = PropertyMapping::new("level", "1", DataType::Int).with_scale(0.5, 1.0);
        assert_eq!(mapping.convert_raw(5), serde_json::json!(4));
    }

    #[test]
    fn bool_extracts_bit() {
        let mapping = PropertyMapping::new("alarm", "7", DataType::Bool).with_bit(3);
        assert_eq!(mapping.convert_raw(0b1000), Value::Bool(true));
        assert_eq!(mapping.convert_raw(0b0111), Value::Bool(false));
    }

    #[test]
    fn addresses_accept_hex() {
        let mapping = PropertyMapping::new("x", "0x0A", DataType::Int).with_function_code("0x03");
        assert_eq!(mapping.numeric_address(), Some(10));
        assert_eq!(mapping.function_code_value(), Some(3));
    }

    #[test]
    fn device_level_wins() {
        let device = vec![PropertyMapping::new("temp", "10", DataType::Int)];
        let product = vec![
            PropertyMapping::new("temp", "20", DataType::Int),
            PropertyMapping::new("hum", "21", DataType::Int),
        ];
        let resolved = resolve_mappings(device, product);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].address, "10");
        assert_eq!(resolved[1].identifier, "hum");
    }
}
