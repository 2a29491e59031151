//! ISO-on-TCP（TPKT + COTP）与 S7 报文构造、应答解析。
//!
//! 读写请求的起始地址按位地址编码（字节偏移 × 8 + 位号），长度按字节计数。

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

pub const TPKT_HEADER_LEN: usize = 4;
/// TPKT + COTP 数据头
pub const FRAME_HEADER_LEN: usize = 7;
pub const COTP_CONFIRM_LEN: usize = 22;
pub const SETUP_RESPONSE_LEN: usize = 27;
pub const WRITE_RESPONSE_LEN: usize = 22;

const READ_REQUEST_LEN: u16 = 31;
const WRITE_REQUEST_BASE_LEN: u16 = 35;
const FUNCTION_READ_VAR: u8 = 0x04;
const FUNCTION_WRITE_VAR: u8 = 0x05;
const TRANSPORT_SIZE_BYTE: u8 = 0x02;
const RETURN_CODE_SUCCESS: u8 = 0xFF;
/// 成功应答在数据项中的标记：返回码 0xFF + 传输类型 0x04
const SUCCESS_MARKER: [u8; 2] = [0xFF, 0x04];
/// 成功标记的最大搜索范围
const MARKER_SEARCH_LIMIT: usize = 20;

/// COTP 连接请求，目标 TSAP 由机架号与槽号决定。
pub fn cotp_connect_request(rack: u8, slot: u8) -> Vec<u8> {
    vec![
        0x03, 0x00, 0x00, 0x16, // TPKT
        0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, // COTP CR
        0xC0, 0x01, 0x0A, // TPDU 大小
        0xC1, 0x02, 0x01, 0x00, // 源 TSAP
        0xC2, 0x02, 0x01, rack.wrapping_mul(32).wrapping_add(slot), // 目标 TSAP
    ]
}

/// S7 通信建立请求（Setup Communication）。
pub fn setup_communication_request() -> Vec<u8> {
    vec![
        0x03, 0x00, 0x00, 0x19, // TPKT
        0x02, 0xF0, 0x80, // COTP DT
        0x32, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x08, 0x00, 0x00, // S7 头
        0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0, // 参数
    ]
}

fn put_job_header(buf: &mut BytesMut, total_len: u16, data_len: u16) {
    buf.put_slice(&[0x03, 0x00]);
    buf.put_u16(total_len);
    buf.put_slice(&[0x02, 0xF0, 0x80]);
    buf.put_u8(0x32);
    buf.put_u8(0x01);
    buf.put_u16(0x0000);
    buf.put_u16(0x0001);
    buf.put_u16(0x000E);
    buf.put_u16(data_len);
}

fn put_item(buf: &mut BytesMut, area: u8, db: u16, bit_address: u32, byte_count: u16) {
    buf.put_slice(&[0x12, 0x0A, 0x10, TRANSPORT_SIZE_BYTE]);
    buf.put_u16(byte_count);
    buf.put_u16(db);
    buf.put_u8(area);
    buf.put_u8(((bit_address >> 16) & 0xFF) as u8);
    buf.put_u16((bit_address & 0xFFFF) as u16);
}

/// 字节偏移上限：位地址字段只有 24 位。
pub const MAX_BYTE_OFFSET: u32 = 0x00FF_FFFF >> 3;

fn bit_address(start_byte: u32) -> Result<u32, ProtocolError> {
    if start_byte > MAX_BYTE_OFFSET {
        return Err(ProtocolError::S7(format!("byte offset out of range: {start_byte}")));
    }
    Ok(start_byte << 3)
}

/// 读变量请求（31 字节）。
pub fn read_request(area: u8, db: u16, start_byte: u32, size: u16) -> Result<Vec<u8>, ProtocolError> {
    let bit_address = bit_address(start_byte)?;
    let mut buf = BytesMut::with_capacity(usize::from(READ_REQUEST_LEN));
    put_job_header(&mut buf, READ_REQUEST_LEN, 0);
    buf.put_u8(FUNCTION_READ_VAR);
    buf.put_u8(0x01);
    put_item(&mut buf, area, db, bit_address, size);
    Ok(buf.to_vec())
}

/// 写变量请求（35 + n 字节）。
pub fn write_request(area: u8, db: u16, start_byte: u32, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let bit_address = bit_address(start_byte)?;
    let len = u16::try_from(data.len())
        .ok()
        .filter(|len| *len <= u16::MAX - WRITE_REQUEST_BASE_LEN)
        .ok_or_else(|| ProtocolError::S7(format!("write payload too large: {}", data.len())))?;
    let total = WRITE_REQUEST_BASE_LEN + len;
    let mut buf = BytesMut::with_capacity(usize::from(total));
    put_job_header(&mut buf, total, len + 4);
    buf.put_u8(FUNCTION_WRITE_VAR);
    buf.put_u8(0x01);
    put_item(&mut buf, area, db, bit_address, len);
    buf.put_u8(0x00);
    buf.put_u8(0x04);
    buf.put_u16(len.saturating_mul(8));
    buf.put_slice(data);
    Ok(buf.to_vec())
}

/// 从 TPKT 头取完整帧长度。
pub fn tpkt_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < TPKT_HEADER_LEN || header[0] != 0x03 {
        return Err(ProtocolError::S7("invalid TPKT header".to_string()));
    }
    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if length < FRAME_HEADER_LEN {
        return Err(ProtocolError::S7(format!("TPKT length too short: {length}")));
    }
    Ok(length)
}

/// 在读应答 PDU（去掉 7 字节帧头）中定位成功标记并取出数据。
pub fn parse_read_response(pdu: &[u8], size: usize) -> Result<Vec<u8>, ProtocolError> {
    let limit = pdu.len().saturating_sub(4).min(MARKER_SEARCH_LIMIT);
    let marker = (0..limit)
        .find(|&index| pdu[index..index + 2] == SUCCESS_MARKER)
        .ok_or_else(|| ProtocolError::S7("read response has no success marker".to_string()))?;
    let begin = marker + 4;
    pdu.get(begin..begin + size)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            ProtocolError::S7(format!(
                "read response too short: need {size} bytes after marker, pdu {}",
                pdu.len()
            ))
        })
}

/// 写应答：完整帧至少 22 字节，第 22 字节为返回码。
pub fn write_succeeded(frame: &[u8]) -> bool {
    frame.len() >= WRITE_RESPONSE_LEN && frame[WRITE_RESPONSE_LEN - 1] == RETURN_CODE_SUCCESS
}

/// 构造读应答帧（本地测试与仿真使用）。
pub fn read_response(data: &[u8]) -> Vec<u8> {
    let item_len = data.len() + 4;
    let total = FRAME_HEADER_LEN + 12 + 2 + item_len;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&[0x03, 0x00]);
    buf.put_u16(total as u16);
    buf.put_slice(&[0x02, 0xF0, 0x80]);
    buf.put_slice(&[0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02]);
    buf.put_u16(item_len as u16);
    buf.put_slice(&[0x00, 0x00]);
    buf.put_slice(&[FUNCTION_READ_VAR, 0x01]);
    buf.put_slice(&SUCCESS_MARKER);
    buf.put_u16((data.len() * 8) as u16);
    buf.put_slice(data);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_encodes_rack_and_slot() {
        let frame = cotp_connect_request(0, 2);
        assert_eq!(frame.len(), 22);
        assert_eq!(frame[21], 2);
        assert_eq!(cotp_connect_request(1, 3)[21], 35);
        assert_eq!(setup_communication_request().len(), 25);
    }

    #[test]
    fn read_request_layout() {
        let frame = read_request(0x84, 1, 100, 2).expect("frame");
        assert_eq!(frame.len(), 31);
        assert_eq!(&frame[0..4], &[0x03, 0x00, 0x00, 0x1F]);
        assert_eq!(frame[17], 0x04);
        assert_eq!(&frame[23..25], &[0x00, 0x02]);
        assert_eq!(&frame[25..27], &[0x00, 0x01]);
        assert_eq!(frame[27], 0x84);
        // 100 × 8 = 800 = 0x000320
        assert_eq!(&frame[28..31], &[0x00, 0x03, 0x20]);
    }

    #[test]
    fn offsets_beyond_address_field_are_rejected() {
        let frame = read_request(0x84, 1, MAX_BYTE_OFFSET, 1).expect("frame");
        assert_eq!(&frame[28..31], &[0xFF, 0xFF, 0xF8]);
        assert!(read_request(0x84, 1, MAX_BYTE_OFFSET + 1, 1).is_err());
        assert!(read_request(0x84, 1, 600_000_000, 2).is_err());
        assert!(write_request(0x84, 1, u32::MAX, &[0x01]).is_err());
    }

    #[test]
    fn write_request_layout() {
        let frame = write_request(0x83, 0, 10, &[0x12, 0x34]).expect("frame");
        assert_eq!(frame.len(), 37);
        assert_eq!(&frame[15..17], &[0x00, 0x06]);
        assert_eq!(frame[17], 0x05);
        assert_eq!(&frame[31..35], &[0x00, 0x04, 0x00, 0x10]);
        assert_eq!(&frame[35..], &[0x12, 0x34]);
    }

    #[test]
    fn response_round_trip_through_marker() {
        let frame = read_response(&[0x01, 0xF4]);
        let length = tpkt_length(&frame).expect("tpkt");
        assert_eq!(length, frame.len());
        let data = parse_read_response(&frame[FRAME_HEADER_LEN..], 2).expect("data");
        assert_eq!(data, vec![0x01, 0xF4]);
    }

    #[test]
    fn missing_marker_is_an_error() {
        let pdu = [0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x05, 0x0A, 0x00];
        assert!(parse_read_response(&pdu, 1).is_err());
    }

    #[test]
    fn write_ack_checks_return_code() {
        let mut ack = vec![0u8; 22];
        assert!(!write_succeeded(&ack));
        ack[21] = 0xFF;
        assert!(write_succeeded(&ack));
        assert!(!write_succeeded(&ack[..21]));
    }
}
