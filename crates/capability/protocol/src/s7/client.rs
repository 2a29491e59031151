//! S7 客户端：每个设备一条 ISO-on-TCP 连接。

use super::address::{S7Address, S7Area, S7Width};
use super::frame;
use crate::error::ProtocolError;
use domain::Device;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 102;
pub const DEFAULT_RACK: u8 = 0;
pub const DEFAULT_SLOT: u8 = 2;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// 设备连接参数。
#[derive(Debug, Clone)]
pub struct S7Endpoint {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    /// 跳过 COTP/Setup 握手（部分网关或仿真器）
    pub skip_handshake: bool,
}

impl S7Endpoint {
    pub fn from_device(device: &Device) -> Result<Self, ProtocolError> {
        let host = device
            .config_str("host")
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                ProtocolError::ConfigParse(format!("device {} has no host", device.device_key))
            })?
            .to_string();
        let port = device
            .config_i64("port")
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_PORT);
        let rack = device
            .config_i64("rack")
            .and_then(|rack| u8::try_from(rack).ok())
            .unwrap_or(DEFAULT_RACK);
        let slot = device
            .config_i64("slot")
            .and_then(|slot| u8::try_from(slot).ok())
            .unwrap_or(DEFAULT_SLOT);
        Ok(Self {
            host,
            port,
            rack,
            slot,
            skip_handshake: device.config_bool("skipHandshake").unwrap_or(false),
        })
    }
}

type Connection = Arc<Mutex<TcpStream>>;

pub struct S7Client {
    io_timeout: Duration,
    connections: Mutex<HashMap<String, Connection>>,
}

impl Default for S7Client {
    fn default() -> Self {
        Self::new(DEFAULT_IO_TIMEOUT)
    }
}

impl S7Client {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            io_timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// 建立连接并完成握手；已连接则直接返回。
    pub async fn connect(&self, device_id: &str, endpoint: &S7Endpoint) -> Result<(), ProtocolError> {
        if self.connections.lock().await.contains_key(device_id) {
            return Ok(());
        }
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let mut stream = match timeout(self.io_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ProtocolError::Connection(format!("{addr}: {err}"))),
            Err(_) => return Err(ProtocolError::Timeout(format!("connect {addr}"))),
        };
        stream.set_nodelay(true)?;
        if !endpoint.skip_handshake {
            self.handshake(&mut stream, endpoint.rack, endpoint.slot).await?;
        }
        info!(
            target: "gw.s7",
            device_id,
            addr = %addr,
            rack = endpoint.rack,
            slot = endpoint.slot,
            skip_handshake = endpoint.skip_handshake,
            "s7_connected"
        );
        self.connections
            .lock()
            .await
            .insert(device_id.to_string(), Arc::new(Mutex::new(stream)));
        Ok(())
    }

    async fn handshake(&self, stream: &mut TcpStream, rack: u8, slot: u8) -> Result<(), ProtocolError> {
        stream.write_all(&frame::cotp_connect_request(rack, slot)).await?;
        let confirm = self.read_frame(stream).await?;
        if confirm.len() < frame::COTP_CONFIRM_LEN {
            return Err(ProtocolError::S7(format!(
                "short COTP confirm: {} bytes",
                confirm.len()
            )));
        }
        stream.write_all(&frame::setup_communication_request()).await?;
        let setup = self.read_frame(stream).await?;
        if setup.len() < frame::SETUP_RESPONSE_LEN {
            return Err(ProtocolError::S7(format!(
                "short setup response: {} bytes",
                setup.len()
            )));
        }
        Ok(())
    }

    /// 读取一个完整 TPKT 帧。
    async fn read_frame(&self, stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
        let read = async {
            let mut header = [0u8; frame::TPKT_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let length = frame::tpkt_length(&header)?;
            let mut buf = vec![0u8; length];
            buf[..frame::TPKT_HEADER_LEN].copy_from_slice(&header);
            stream.read_exact(&mut buf[frame::TPKT_HEADER_LEN..]).await?;
            Ok::<_, ProtocolError>(buf)
        };
        timeout(self.io_timeout, read)
            .await
            .map_err(|_| ProtocolError::Timeout("s7 response".to_string()))?
    }

    async fn connection(&self, device_id: &str) -> Result<Connection, ProtocolError> {
        self.connections
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| ProtocolError::Connection(format!("s7 device {device_id} not connected")))
    }

    /// 发送请求并读取应答；IO 失败时关闭该设备连接。
    async fn exchange(&self, device_id: &str, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let conn = self.connection(device_id).await?;
        let result = {
            let mut stream = conn.lock().await;
            match stream.write_all(request).await {
                Ok(()) => self.read_frame(&mut stream).await,
                Err(err) => Err(err.into()),
            }
        };
        if let Err(err) = &result {
            warn!(target: "gw.s7", device_id, error = %err, "s7_exchange_failed");
            self.disconnect(device_id).await;
        }
        result
    }

    pub async fn read_area(
        &self,
        device_id: &str,
        area: S7Area,
        db: u16,
        start: u32,
        size: u16,
    ) -> Result<Vec<u8>, ProtocolError> {
        let request = frame::read_request(area.code(), db, start, size)?;
        let response = self.exchange(device_id, &request).await?;
        let data = frame::parse_read_response(&response[frame::FRAME_HEADER_LEN..], usize::from(size))?;
        debug!(target: "gw.s7", device_id, db, start, size, "s7_area_read");
        Ok(data)
    }

    pub async fn read_db(&self, device_id: &str, db: u16, start: u32, size: u16) -> Result<Vec<u8>, ProtocolError> {
        self.read_area(device_id, S7Area::DataBlock, db, start, size).await
    }

    pub async fn read_merker(&self, device_id: &str, start: u32, size: u16) -> Result<Vec<u8>, ProtocolError> {
        self.read_area(device_id, S7Area::Merker, 0, start, size).await
    }

    /// 按地址读取；位地址只读 1 字节。
    pub async fn read_address(
        &self,
        device_id: &str,
        address: &S7Address,
        size: u16,
    ) -> Result<Vec<u8>, ProtocolError> {
        let size = if address.width == S7Width::Bit { 1 } else { size };
        self.read_area(device_id, address.area, address.db, address.byte_offset, size)
            .await
    }

    /// 写区域数据，返回 PLC 是否确认成功。
    pub async fn write_area(
        &self,
        device_id: &str,
        area: S7Area,
        db: u16,
        start: u32,
        data: &[u8],
    ) -> Result<bool, ProtocolError> {
        let request = frame::write_request(area.code(), db, start, data)?;
        let response = self.exchange(device_id, &request).await?;
        Ok(frame::write_succeeded(&response))
    }

    pub async fn write_db(&self, device_id: &str, db: u16, start: u32, data: &[u8]) -> Result<bool, ProtocolError> {
        self.write_area(device_id, S7Area::DataBlock, db, start, data).await
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.connections.lock().await.contains_key(device_id)
    }

    pub async fn disconnect(&self, device_id: &str) -> bool {
        let removed = self.connections.lock().await.remove(device_id);
        if removed.is_some() {
            info!(target: "gw.s7", device_id, "s7_disconnected");
        }
        removed.is_some()
    }

    pub async fn close_all(&self) {
        let count = {
            let mut connections = self.connections.lock().await;
            let count = connections.len();
            connections.clear();
            count
        };
        info!(target: "gw.s7", count, "s7_connections_closed");
    }
}
