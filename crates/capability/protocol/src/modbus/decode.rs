//! 寄存器读取规划与按映射解码。
//!
//! 每个 16 位寄存器按无符号原始值交给映射转换；位读取（0x01/0x02）直接得到布尔值。

use domain::{DataMap, PropertyMapping};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;

/// 未声明功能码的映射按保持寄存器读取
pub const DEFAULT_FUNCTION_CODE: u8 = READ_HOLDING_REGISTERS;

/// 没有任何映射时的默认读取范围
const DEFAULT_READ_QUANTITY: u16 = 16;

/// 单帧读取上限：寄存器 125 个，线圈/离散输入 2000 个
const MAX_READ_REGISTERS: u16 = 125;
const MAX_READ_BITS: u16 = 2000;

/// 单次批量读取。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    pub function_code: u8,
    pub start: u16,
    pub quantity: u16,
}

pub fn is_read_function(code: u8) -> bool {
    (READ_COILS..=READ_INPUT_REGISTERS).contains(&code)
}

pub fn is_bit_function(code: u8) -> bool {
    matches!(code, READ_COILS | READ_DISCRETE_INPUTS)
}

fn mapping_function(mapping: &PropertyMapping) -> u8 {
    mapping.function_code_value().unwrap_or(DEFAULT_FUNCTION_CODE)
}

fn max_quantity(function_code: u8) -> u16 {
    if is_bit_function(function_code) {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    }
}

/// 按功能码分组，组内按地址顺序切块，每块不超过单帧读取上限；没有映射时读取保持寄存器 0..16。
pub fn plan_reads(mappings: &[PropertyMapping]) -> Vec<ReadPlan> {
    let mut addresses: BTreeMap<u8, BTreeSet<u16>> = BTreeMap::new();
    for mapping in mappings {
        let code = mapping_function(mapping);
        if !is_read_function(code) {
            continue;
        }
        let Some(address) = mapping.numeric_address() else {
            continue;
        };
        addresses.entry(code).or_default().insert(address);
    }
    if addresses.is_empty() {
        return vec![ReadPlan {
            function_code: DEFAULT_FUNCTION_CODE,
            start: 0,
            quantity: DEFAULT_READ_QUANTITY,
        }];
    }

    let mut plans = Vec::new();
    for (function_code, set) in addresses {
        let limit = max_quantity(function_code);
        let mut current: Option<(u16, u16)> = None;
        for address in set {
            current = match current {
                Some((start, _)) if address - start < limit => Some((start, address)),
                Some((start, last)) => {
                    plans.push(ReadPlan {
                        function_code,
                        start,
                        quantity: last - start + 1,
                    });
                    Some((address, address))
                }
                None => Some((address, address)),
            };
        }
        if let Some((start, last)) = current {
            plans.push(ReadPlan {
                function_code,
                start,
                quantity: last - start + 1,
            });
        }
    }
    plans
}

/// 解码寄存器读取结果。
///
/// 只使用功能码匹配且地址落在读取范围内的映射；没有映射时输出 `register_{地址}` 原始值。
pub fn decode_registers(
    function_code: u8,
    start: u16,
    registers: &[u16],
    mappings: &[PropertyMapping],
) -> DataMap {
    let mut data = DataMap::new();
    let matched = matching(function_code, mappings);
    if matched.is_empty() {
        for (index, raw) in registers.iter().enumerate() {
            let address = usize::from(start) + index;
            data.insert(format!("register_{address}"), Value::from(*raw));
        }
        return data;
    }
    for mapping in matched {
        let Some(raw) = slot(start, registers, mapping) else {
            continue;
        };
        data.insert(mapping.identifier.clone(), mapping.convert_raw(i64::from(raw)));
    }
    data
}

/// 解码线圈/离散输入读取结果。
pub fn decode_bits(
    function_code: u8,
    start: u16,
    bits: &[bool],
    mappings: &[PropertyMapping],
) -> DataMap {
    let mut data = DataMap::new();
    let matched = matching(function_code, mappings);
    if matched.is_empty() {
        for (index, bit) in bits.iter().enumerate() {
            let address = usize::from(start) + index;
            data.insert(format!("coil_{address}"), Value::Bool(*bit));
        }
        return data;
    }
    for mapping in matched {
        if let Some(bit) = slot(start, bits, mapping) {
            data.insert(mapping.identifier.clone(), Value::Bool(bit));
        }
    }
    data
}

fn matching(function_code: u8, mappings: &[PropertyMapping]) -> Vec<&PropertyMapping> {
    mappings
        .iter()
        .filter(|mapping| mapping_function(mapping) == function_code)
        .collect()
}

fn slot<T: Copy>(start: u16, values: &[T], mapping: &PropertyMapping) -> Option<T> {
    let address = mapping.numeric_address()?;
    let index = address.checked_sub(start)?;
    values.get(usize::from(index)).copied()
}
