//! 写入规划：连续地址合并为一次批量写，否则逐地址单写。

use crate::error::ProtocolError;
use serde_json::Value;

pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const MASK_WRITE_REGISTER: u8 = 0x16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SingleCoil { address: u16, value: bool },
    MultipleCoils { start: u16, values: Vec<bool> },
    SingleRegister { address: u16, value: u16 },
    MultipleRegisters { start: u16, values: Vec<u16> },
    /// 寄存器掩码写：结果 = (当前值 & and_mask) | (or_mask & !and_mask)
    MaskRegister { address: u16, and_mask: u16, or_mask: u16 },
}

impl WriteOp {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::SingleCoil { .. } => WRITE_SINGLE_COIL,
            Self::MultipleCoils { .. } => WRITE_MULTIPLE_COILS,
            Self::SingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Self::MultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Self::MaskRegister { .. } => MASK_WRITE_REGISTER,
        }
    }

    /// 只改寄存器中的一个位，其余位保持不变。
    pub fn register_bit(address: u16, bit: u8, value: &Value) -> Result<Self, ProtocolError> {
        if bit > 15 {
            return Err(ProtocolError::ConfigParse(format!("bit index out of range: {bit}")));
        }
        let mask = 1u16 << bit;
        Ok(Self::MaskRegister {
            address,
            and_mask: !mask,
            or_mask: if coil_value(value)? { mask } else { 0 },
        })
    }
}

fn is_coil_function(code: u8) -> Result<bool, ProtocolError> {
    match code {
        WRITE_SINGLE_COIL | WRITE_MULTIPLE_COILS => Ok(true),
        WRITE_SINGLE_REGISTER | WRITE_MULTIPLE_REGISTERS => Ok(false),
        other => Err(ProtocolError::ConfigParse(format!(
            "unsupported write function code: 0x{other:02X}"
        ))),
    }
}

/// 规划写入操作。
///
/// 功能码只决定写线圈还是寄存器；地址是否连续决定单写或批量写。
pub fn plan_writes(function_code: u8, entries: &[(u16, Value)]) -> Result<Vec<WriteOp>, ProtocolError> {
    let coils = is_coil_function(function_code)?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    let mut sorted: Vec<&(u16, Value)> = entries.iter().collect();
    sorted.sort_by_key(|(address, _)| *address);
    let contiguous = sorted
        .windows(2)
        .all(|pair| u32::from(pair[1].0) == u32::from(pair[0].0) + 1);

    if coils {
        let values = sorted
            .iter()
            .map(|(_, value)| coil_value(value))
            .collect::<Result<Vec<_>, _>>()?;
        if contiguous && values.len() > 1 {
            return Ok(vec![WriteOp::MultipleCoils {
                start: sorted[0].0,
                values,
            }]);
        }
        return Ok(sorted
            .iter()
            .zip(values)
            .map(|((address, _), value)| WriteOp::SingleCoil {
                address: *address,
                value,
            })
            .collect());
    }

    let values = sorted
        .iter()
        .map(|(_, value)| register_value(value))
        .collect::<Result<Vec<_>, _>>()?;
    if contiguous && values.len() > 1 {
        return Ok(vec![WriteOp::MultipleRegisters {
            start: sorted[0].0,
            values,
        }]);
    }
    Ok(sorted
        .iter()
        .zip(values)
        .map(|((address, _), value)| WriteOp::SingleRegister {
            address: *address,
            value,
        })
        .collect())
}

pub fn coil_value(value: &Value) -> Result<bool, ProtocolError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(text) => Ok(matches!(text.trim(), "1" | "true" | "on")),
        other => Err(ProtocolError::DataParse(format!("not a coil value: {other}"))),
    }
}

/// 寄存器值：接受 -32768..=65535，负数按补码写入。
pub fn register_value(value: &Value) -> Result<u16, ProtocolError> {
    let number = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|n| n.round() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
    .ok_or_else(|| ProtocolError::DataParse(format!("not a register value: {value}")))?;
    if number < 0 {
        i16::try_from(number)
            .map(|signed| signed as u16)
            .map_err(|_| ProtocolError::DataParse(format!("register value out of range: {number}")))
    } else {
        u16::try_from(number)
            .map_err(|_| ProtocolError::DataParse(format!("register value out of range: {number}")))
    }
}
