//! MQTT 3.1 / 3.1.1 报文与 tokio-util 编解码器。

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 剩余长度字段最大值（4 字节变长编码）
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// CONNACK 返回码。
pub mod connack {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x04;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// `MQTT`（3.1.1）或 `MQIsdp`（3.1）
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: &str) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(Bytes::copy_from_slice(password.as_bytes()));
        self
    }

    /// 协议版本 3（3.1）或 4（3.1.1）
    pub fn supported_version(&self) -> bool {
        matches!(self.protocol_level, 3 | 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    /// QoS ≥ 1 时存在
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: &str, qos: u8, packet_id: Option<u16>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, return_code: u8 },
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck { .. } => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PubRec(_) => "PUBREC",
            Self::PubRel(_) => "PUBREL",
            Self::PubComp(_) => "PUBCOMP",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubAck { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubAck(_) => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

fn malformed(message: impl Into<String>) -> ProtocolError {
    ProtocolError::Mqtt(message.into())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u16(buf)?);
    if buf.remaining() < len {
        return Err(malformed("length prefix exceeds packet"));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = read_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("invalid utf-8 string"))
}

fn put_binary(dst: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| malformed("field longer than 65535 bytes"))?;
    dst.put_u16(len);
    dst.put_slice(data);
    Ok(())
}

/// 解析剩余长度；数据不足返回 `Ok(None)`。
fn remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in src.iter().enumerate().take(4) {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if src.len() >= 4 {
        return Err(malformed("remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

fn put_remaining_length(dst: &mut BytesMut, mut len: usize) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(malformed(format!("packet too large: {len}")));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// MQTT 编解码器。
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let Some((len, len_bytes)) = remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if len > self.max_packet_size {
            return Err(malformed(format!("packet exceeds limit: {len}")));
        }
        let total = 1 + len_bytes + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total).freeze();
        let header = frame.get_u8();
        frame.advance(len_bytes);
        decode_body(header, frame).map(Some)
    }
}

fn decode_body(header: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    let flags = header & 0x0F;
    let packet = match header >> 4 {
        1 => Packet::Connect(decode_connect(&mut body)?),
        2 => {
            let ack_flags = read_u8(&mut body)?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 == 1,
                return_code: read_u8(&mut body)?,
            }
        }
        3 => {
            let qos = (flags >> 1) & 0x03;
            if qos > 2 {
                return Err(malformed("invalid publish qos"));
            }
            let topic = read_string(&mut body)?;
            let packet_id = if qos > 0 {
                Some(read_u16(&mut body)?)
            } else {
                None
            };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: body,
            })
        }
        4 => Packet::PubAck(read_u16(&mut body)?),
        5 => Packet::PubRec(read_u16(&mut body)?),
        6 => Packet::PubRel(read_u16(&mut body)?),
        7 => Packet::PubComp(read_u16(&mut body)?),
        8 => {
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body)?;
                let qos = read_u8(&mut body)? & 0x03;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(malformed("subscribe without topic filters"));
            }
            Packet::Subscribe { packet_id, filters }
        }
        9 => {
            let packet_id = read_u16(&mut body)?;
            Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }
        }
        10 => {
            let packet_id = read_u16(&mut body)?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                topics.push(read_string(&mut body)?);
            }
            Packet::Unsubscribe { packet_id, topics }
        }
        11 => Packet::UnsubAck(read_u16(&mut body)?),
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        other => return Err(malformed(format!("unsupported packet type: {other}"))),
    };
    Ok(packet)
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, ProtocolError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    let flags = read_u8(body)?;
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;
    let will = if flags & 0x04 != 0 {
        let topic = read_string(body)?;
        let payload = read_binary(body)?;
        Some(LastWill {
            topic,
            payload,
            qos: (flags >> 3) & 0x03,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(body)?)
    } else {
        None
    };
    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

impl Encoder<Packet> for MqttCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let header = match &packet {
            Packet::Connect(connect) => {
                encode_connect(connect, &mut body)?;
                0x10
            }
            Packet::ConnAck {
                session_present,
                return_code,
            } => {
                body.put_u8(u8::from(*session_present));
                body.put_u8(*return_code);
                0x20
            }
            Packet::Publish(publish) => {
                put_binary(&mut body, publish.topic.as_bytes())?;
                if publish.qos > 0 {
                    let packet_id = publish
                        .packet_id
                        .ok_or_else(|| malformed("qos > 0 publish without packet id"))?;
                    body.put_u16(packet_id);
                }
                body.put_slice(&publish.payload);
                0x30 | (u8::from(publish.dup) << 3)
                    | ((publish.qos & 0x03) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck(packet_id) => {
                body.put_u16(*packet_id);
                0x40
            }
            Packet::PubRec(packet_id) => {
                body.put_u16(*packet_id);
                0x50
            }
            Packet::PubRel(packet_id) => {
                body.put_u16(*packet_id);
                0x62
            }
            Packet::PubComp(packet_id) => {
                body.put_u16(*packet_id);
                0x70
            }
            Packet::Subscribe { packet_id, filters } => {
                body.put_u16(*packet_id);
                for (filter, qos) in filters {
                    put_binary(&mut body, filter.as_bytes())?;
                    body.put_u8(*qos);
                }
                0x82
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                body.put_u16(*packet_id);
                body.put_slice(return_codes);
                0x90
            }
            Packet::Unsubscribe { packet_id, topics } => {
                body.put_u16(*packet_id);
                for topic in topics {
                    put_binary(&mut body, topic.as_bytes())?;
                }
                0xA2
            }
            Packet::UnsubAck(packet_id) => {
                body.put_u16(*packet_id);
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };
        dst.reserve(body.len() + 5);
        dst.put_u8(header);
        put_remaining_length(dst, body.len())?;
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    put_binary(body, connect.protocol_name.as_bytes())?;
    body.put_u8(connect.protocol_level);
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos & 0x03) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_binary(body, connect.client_id.as_bytes())?;
    if let Some(will) = &connect.will {
        put_binary(body, will.topic.as_bytes())?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_binary(body, username.as_bytes())?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MqttCodec::default().encode(packet, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn decodes_connect_with_credentials() {
        let connect = Connect::new("meter-01").with_credentials("meter-01", "s3cret");
        let mut buf = encode(Packet::Connect(connect.clone()));
        let decoded = MqttCodec::default().decode(&mut buf).expect("decode");
        assert_eq!(decoded, Some(Packet::Connect(connect)));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let full = encode(Packet::Publish(Publish::new("/p/d/property/post", 1, Some(7), "{}")));
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut buf).expect("partial"), None);
        buf.extend_from_slice(&full[full.len() - 1..]);
        match codec.decode(&mut buf).expect("decode") {
            Some(Packet::Publish(publish)) => {
                assert_eq!(publish.packet_id, Some(7));
                assert_eq!(publish.qos, 1);
                assert_eq!(&publish.payload[..], b"{}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multi_byte_remaining_length() {
        let payload = vec![b'x'; 300];
        let mut buf = encode(Packet::Publish(Publish::new("t", 0, None, payload.clone())));
        // 300 + 3 字节主题 > 127，剩余长度占 2 字节
        assert_eq!(buf[1] & 0x80, 0x80);
        match MqttCodec::default().decode(&mut buf).expect("decode") {
            Some(Packet::Publish(publish)) => assert_eq!(publish.payload.len(), 300),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixed_packets_encode_exactly() {
        assert_eq!(&encode(Packet::PingResp)[..], &[0xD0, 0x00]);
        assert_eq!(
            &encode(Packet::ConnAck {
                session_present: true,
                return_code: connack::ACCEPTED
            })[..],
            &[0x20, 0x02, 0x01, 0x00]
        );
        assert_eq!(
            &encode(Packet::SubAck {
                packet_id: 5,
                return_codes: vec![1, 1]
            })[..],
            &[0x90, 0x04, 0x00, 0x05, 0x01, 0x01]
        );
    }

    #[test]
    fn oversized_packets_are_rejected() {
        let mut buf = encode(Packet::Publish(Publish::new("t", 0, None, vec![0u8; 64])));
        assert!(MqttCodec::new(16).decode(&mut buf).is_err());
    }

    #[test]
    fn subscribe_decodes_filters() {
        let mut buf = encode(Packet::Subscribe {
            packet_id: 3,
            filters: vec![("/p/d/command/#".to_string(), 1)],
        });
        assert_eq!(
            MqttCodec::default().decode(&mut buf).expect("decode"),
            Some(Packet::Subscribe {
                packet_id: 3,
                filters: vec![("/p/d/command/#".to_string(), 1)]
            })
        );
    }
}
