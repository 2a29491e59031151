//! S7 地址解析：`DB1.DBW100`、`DB1.DBX0.3`、`MW10`、`M0.0`、`VW4`、`IB0`、`QX0.1`。

use super::frame::MAX_BYTE_OFFSET;
use crate::error::ProtocolError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// 存储区代码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Area {
    Inputs,
    Outputs,
    Merker,
    DataBlock,
}

impl S7Area {
    pub fn code(&self) -> u8 {
        match self {
            Self::Inputs => 0x81,
            Self::Outputs => 0x82,
            Self::Merker => 0x83,
            Self::DataBlock => 0x84,
        }
    }
}

/// 地址宽度字母：X 位、B 字节、W 字、D 双字。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Width {
    Bit,
    Byte,
    Word,
    DWord,
}

impl S7Width {
    fn parse(letter: &str) -> Self {
        match letter {
            "B" => Self::Byte,
            "W" => Self::Word,
            "D" => Self::DWord,
            _ => Self::Bit,
        }
    }

    pub fn byte_len(&self) -> u16 {
        match self {
            Self::Bit | Self::Byte => 1,
            Self::Word => 2,
            Self::DWord => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Address {
    pub area: S7Area,
    /// DB 块号；非 DB 区为 0
    pub db: u16,
    pub byte_offset: u32,
    pub width: S7Width,
    pub bit: Option<u8>,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:DB(?P<db>\d+)\.DB(?P<dbw>[BWDX])(?P<dbo>\d+)(?:\.(?P<dbb>[0-7]))?|(?P<area>[MVIQE])(?P<w>[BWDX]?)(?P<o>\d+)(?:\.(?P<b>[0-7]))?)$",
        )
        .unwrap_or_else(|err| panic!("invalid S7 address pattern: {err}"))
    })
}

impl FromStr for S7Address {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let normalized = text.trim().to_ascii_uppercase();
        let invalid = || ProtocolError::ConfigParse(format!("invalid S7 address: {text}"));
        let caps = pattern().captures(&normalized).ok_or_else(invalid)?;
        let number = |name: &str| -> Result<Option<u32>, ProtocolError> {
            caps.name(name)
                .map(|m| m.as_str().parse::<u32>().map_err(|_| invalid()))
                .transpose()
        };

        if let Some(db) = caps.name("db") {
            let db = db.as_str().parse::<u16>().map_err(|_| invalid())?;
            let width = S7Width::parse(caps.name("dbw").map_or("", |m| m.as_str()));
            let byte_offset = number("dbo")?.ok_or_else(invalid)?;
            let bit = number("dbb")?.map(|bit| bit as u8);
            return build(S7Area::DataBlock, db, byte_offset, width, bit).ok_or_else(invalid);
        }

        let letter = caps.name("area").map_or("", |m| m.as_str());
        let (area, db) = match letter {
            "M" => (S7Area::Merker, 0),
            // V 区即 DB1
            "V" => (S7Area::DataBlock, 1),
            "I" | "E" => (S7Area::Inputs, 0),
            _ => (S7Area::Outputs, 0),
        };
        let bit = number("b")?.map(|bit| bit as u8);
        let width_letter = caps.name("w").map_or("", |m| m.as_str());
        let width = if width_letter.is_empty() {
            if bit.is_none() {
                return Err(invalid());
            }
            S7Width::Bit
        } else {
            S7Width::parse(width_letter)
        };
        let byte_offset = number("o")?.ok_or_else(invalid)?;
        build(area, db, byte_offset, width, bit).ok_or_else(invalid)
    }
}

/// 位地址必须带位号，非位地址不得带位号；偏移须放得进 24 位位地址。
fn build(area: S7Area, db: u16, byte_offset: u32, width: S7Width, bit: Option<u8>) -> Option<S7Address> {
    if (width == S7Width::Bit) != bit.is_some() || byte_offset > MAX_BYTE_OFFSET {
        return None;
    }
    Some(S7Address {
        area,
        db,
        byte_offset,
        width,
        bit,
    })
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = match self.width {
            S7Width::Bit => "X",
            S7Width::Byte => "B",
            S7Width::Word => "W",
            S7Width::DWord => "D",
        };
        match self.area {
            S7Area::DataBlock => write!(f, "DB{}.DB{}{}", self.db, width, self.byte_offset)?,
            S7Area::Merker => write!(f, "M{}{}", width, self.byte_offset)?,
            S7Area::Inputs => write!(f, "I{}{}", width, self.byte_offset)?,
            S7Area::Outputs => write!(f, "Q{}{}", width, self.byte_offset)?,
        }
        if let Some(bit) = self.bit {
            write!(f, ".{bit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> S7Address {
        text.parse().expect("address")
    }

    #[test]
    fn data_block_word() {
        let address = parse("DB1.DBW100");
        assert_eq!(address.area, S7Area::DataBlock);
        assert_eq!(address.db, 1);
        assert_eq!(address.byte_offset, 100);
        assert_eq!(address.width, S7Width::Word);
        assert_eq!(address.bit, None);
    }

    #[test]
    fn data_block_bit() {
        let address = parse("db2.dbx0.3");
        assert_eq!(address.db, 2);
        assert_eq!(address.width, S7Width::Bit);
        assert_eq!(address.bit, Some(3));
    }

    #[test]
    fn v_area_maps_to_db1() {
        let address = parse("VW4");
        assert_eq!(address.area, S7Area::DataBlock);
        assert_eq!(address.db, 1);
        assert_eq!(address.byte_offset, 4);
    }

    #[test]
    fn merker_inputs_outputs() {
        assert_eq!(parse("MW10").area.code(), 0x83);
        assert_eq!(parse("M0.0").width, S7Width::Bit);
        assert_eq!(parse("IB0").area, S7Area::Inputs);
        let q = parse("QX0.1");
        assert_eq!(q.area.code(), 0x82);
        assert_eq!(q.bit, Some(1));
    }

    #[test]
    fn rejects_malformed_addresses() {
        for text in ["DB1.DBW", "XW10", "MW10.2", "DB1.DBX4", "M10", ""] {
            assert!(text.parse::<S7Address>().is_err(), "{text}");
        }
    }

    #[test]
    fn rejects_offsets_beyond_24_bit_address() {
        assert_eq!(parse("DB1.DBB2097151").byte_offset, MAX_BYTE_OFFSET);
        for text in ["DB1.DBW2097152", "DB1.DBW600000000", "MW99999999999"] {
            assert!(text.parse::<S7Address>().is_err(), "{text}");
        }
    }

    #[test]
    fn displays_canonical_form() {
        assert_eq!(parse("db1.dbx0.3").to_string(), "DB1.DBX0.3");
        assert_eq!(parse("VW4").to_string(), "DB1.DBW4");
    }
}
