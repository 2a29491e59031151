//! S7 大端字节布局读写。越界读取返回 0/false，越界写入忽略。

use domain::{DataType, PropertyMapping};
use serde_json::Value;

fn array<const N: usize>(buf: &[u8], pos: usize) -> Option<[u8; N]> {
    buf.get(pos..pos.checked_add(N)?)?.try_into().ok()
}

pub fn get_bool(buf: &[u8], pos: usize, bit: u8) -> bool {
    buf.get(pos).is_some_and(|byte| (byte >> (bit & 7)) & 1 == 1)
}

pub fn get_byte(buf: &[u8], pos: usize) -> u8 {
    buf.get(pos).copied().unwrap_or(0)
}

pub fn get_word(buf: &[u8], pos: usize) -> u16 {
    array(buf, pos).map(u16::from_be_bytes).unwrap_or(0)
}

pub fn get_int(buf: &[u8], pos: usize) -> i16 {
    array(buf, pos).map(i16::from_be_bytes).unwrap_or(0)
}

pub fn get_dword(buf: &[u8], pos: usize) -> u32 {
    array(buf, pos).map(u32::from_be_bytes).unwrap_or(0)
}

pub fn get_dint(buf: &[u8], pos: usize) -> i32 {
    array(buf, pos).map(i32::from_be_bytes).unwrap_or(0)
}

pub fn get_real(buf: &[u8], pos: usize) -> f32 {
    array(buf, pos).map(f32::from_be_bytes).unwrap_or(0.0)
}

pub fn get_lreal(buf: &[u8], pos: usize) -> f64 {
    array(buf, pos).map(f64::from_be_bytes).unwrap_or(0.0)
}

fn put(buf: &mut [u8], pos: usize, bytes: &[u8]) {
    if let Some(end) = pos.checked_add(bytes.len())
        && let Some(slot) = buf.get_mut(pos..end)
    {
        slot.copy_from_slice(bytes);
    }
}

pub fn set_bool(buf: &mut [u8], pos: usize, bit: u8, value: bool) {
    if let Some(byte) = buf.get_mut(pos) {
        let mask = 1u8 << (bit & 7);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

pub fn set_byte(buf: &mut [u8], pos: usize, value: u8) {
    put(buf, pos, &[value]);
}

pub fn set_word(buf: &mut [u8], pos: usize, value: u16) {
    put(buf, pos, &value.to_be_bytes());
}

pub fn set_int(buf: &mut [u8], pos: usize, value: i16) {
    put(buf, pos, &value.to_be_bytes());
}

pub fn set_dword(buf: &mut [u8], pos: usize, value: u32) {
    put(buf, pos, &value.to_be_bytes());
}

pub fn set_dint(buf: &mut [u8], pos: usize, value: i32) {
    put(buf, pos, &value.to_be_bytes());
}

pub fn set_real(buf: &mut [u8], pos: usize, value: f32) {
    put(buf, pos, &value.to_be_bytes());
}

pub fn set_lreal(buf: &mut [u8], pos: usize, value: f64) {
    put(buf, pos, &value.to_be_bytes());
}

/// 按映射类型把读取到的字节转换为属性值（含缩放/偏移）。
pub fn decode_value(buf: &[u8], bit: Option<u8>, mapping: &PropertyMapping) -> Value {
    match mapping.data_type {
        DataType::Bool => Value::Bool(get_bool(buf, 0, bit.or(mapping.bit_index).unwrap_or(0))),
        DataType::Byte => mapping.convert_number(f64::from(get_byte(buf, 0))),
        DataType::Int => mapping.convert_number(f64::from(get_int(buf, 0))),
        DataType::Word => mapping.convert_number(f64::from(get_word(buf, 0))),
        DataType::Dint => mapping.convert_number(f64::from(get_dint(buf, 0))),
        DataType::Float => mapping.convert_number(f64::from(get_real(buf, 0))),
        DataType::Double => mapping.convert_number(get_lreal(buf, 0)),
        DataType::String => Value::String(String::from_utf8_lossy(buf).trim_end_matches('\0').to_string()),
    }
}

/// 把属性值编码为写入字节；布尔值返回 None（需按位读改写）。
pub fn encode_value(value: &Value, data_type: DataType) -> Option<Vec<u8>> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::String(text) => text.trim().parse().ok()?,
        _ => return None,
    };
    let mut buf = vec![0u8; usize::from(data_type.byte_size())];
    match data_type {
        DataType::Bool => return None,
        DataType::Byte => set_byte(&mut buf, 0, number as u8),
        DataType::Int | DataType::String => set_int(&mut buf, 0, number.round() as i16),
        DataType::Word => set_word(&mut buf, 0, number.round() as u16),
        DataType::Dint => set_dint(&mut buf, 0, number.round() as i32),
        DataType::Float => set_real(&mut buf, 0, number as f32),
        DataType::Double => set_lreal(&mut buf, 0, number),
    }
    Some(buf)
}
