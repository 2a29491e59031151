//! TCP_DIRECT 驱动：网关作为客户端主动连接每个设备。
//!
//! - 设备地址来自设备级配置 `host`/`port`
//! - 按行分帧，每行一个 JSON 对象作为属性上报
//! - 连接断开后按 `reconnectInterval` 重连
//! - 下行数据序列化为 JSON 行写入

use super::{TaskSet, active_devices, line_reader, next_line, parse_object, report_by_key};
use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{DataMap, Device, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

pub const DRIVER_TYPE: &str = "TCP_DIRECT";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "TCP直连驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(TcpDirectDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("connectTimeout", "连接超时(毫秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_CONNECT_TIMEOUT_MS))
            .range(100, 60000),
        DriverConfigField::new(
            "reconnectInterval",
            "重连间隔(毫秒)",
            FieldType::Number,
            FieldLevel::Driver,
        )
        .default_value(json!(DEFAULT_RECONNECT_INTERVAL_MS))
        .range(1000, 600000),
        DriverConfigField::new("host", "设备IP", FieldType::Text, FieldLevel::Device).required(),
        DriverConfigField::new("port", "端口", FieldType::Number, FieldLevel::Device)
            .range(1, 65535)
            .required(),
    ]
}

type Writers = Arc<RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>>;

#[derive(Debug, Clone, Copy)]
struct LinkSettings {
    connect_timeout: Duration,
    reconnect_interval: Duration,
}

pub struct TcpDirectDriver {
    base: DriverBase,
    context: DriverContext,
    settings: LinkSettings,
    writers: Writers,
    tasks: TaskSet,
}

impl TcpDirectDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let settings = LinkSettings {
            connect_timeout: Duration::from_millis(
                config.get_u64_or("connectTimeout", DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            reconnect_interval: Duration::from_millis(
                config.get_u64_or("reconnectInterval", DEFAULT_RECONNECT_INTERVAL_MS),
            ),
        };
        Self {
            base: DriverBase::new(config),
            context,
            settings,
            writers: Arc::new(RwLock::new(HashMap::new())),
            tasks: TaskSet::default(),
        }
    }

    /// 为设备启动连接任务；缺少地址的设备跳过。
    pub fn connect_device(&self, device: &Device) -> Result<(), DriverError> {
        let host = device
            .config_str("host")
            .ok_or_else(|| DriverError::Config(format!("device {} missing host", device.device_key)))?;
        let port = device
            .config_i64("port")
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port > 0)
            .ok_or_else(|| DriverError::Config(format!("device {} missing port", device.device_key)))?;
        let link = DeviceLink {
            device_key: device.device_key.clone(),
            addr: format!("{host}:{port}"),
            settings: self.settings,
            writers: Arc::clone(&self.writers),
            context: self.context.clone(),
        };
        self.tasks.push(tokio::spawn(link.run()));
        Ok(())
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        for device in active_devices(&self.context, &self.base.config().driver_id).await {
            if let Err(err) = self.connect_device(&device) {
                warn!(target: "gw.tcp", device_key = %device.device_key, error = %err, "tcp_device_skipped");
            }
        }
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        let writers: Vec<_> = self.writers.write().await.drain().collect();
        for (device_key, writer) in writers {
            let _ = writer.lock().await.shutdown().await;
            self.context.sink.device_offline(&device_key).await;
        }
        Ok(())
    }

    async fn send_line(&self, device_key: &str, line: &str) -> Result<bool, DriverError> {
        let writer = self.writers.read().await.get(device_key).cloned();
        let Some(writer) = writer else {
            warn!(target: "gw.tcp", device_key, "tcp_device_not_connected");
            return Ok(false);
        };
        let mut frame = line.to_string();
        if !frame.ends_with('\n') {
            frame.push('\n');
        }
        let mut writer = writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(ProtocolError::from)?;
        writer.flush().await.map_err(ProtocolError::from)?;
        Ok(true)
    }
}

/// 单设备连接循环。
struct DeviceLink {
    device_key: String,
    addr: String,
    settings: LinkSettings,
    writers: Writers,
    context: DriverContext,
}

impl DeviceLink {
    async fn run(self) {
        loop {
            debug!(target: "gw.tcp", device_key = %self.device_key, addr = %self.addr, "tcp_connecting");
            match timeout(self.settings.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = self.session(stream).await {
                        warn!(target: "gw.tcp", device_key = %self.device_key, error = %err, "tcp_session_error");
                    }
                    self.writers.write().await.remove(&self.device_key);
                    self.context.sink.device_offline(&self.device_key).await;
                }
                Ok(Err(err)) => {
                    error!(target: "gw.tcp", device_key = %self.device_key, addr = %self.addr, error = %err, "tcp_connect_failed");
                }
                Err(_) => {
                    error!(target: "gw.tcp", device_key = %self.device_key, addr = %self.addr, "tcp_connect_timeout");
                }
            }
            sleep(self.settings.reconnect_interval).await;
        }
    }

    async fn session(&self, stream: TcpStream) -> Result<(), ProtocolError> {
        let peer_ip = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
        let (reader, writer) = stream.into_split();
        self.writers
            .write()
            .await
            .insert(self.device_key.clone(), Arc::new(Mutex::new(writer)));
        info!(target: "gw.tcp", device_key = %self.device_key, addr = %self.addr, "tcp_connected");
        self.context
            .sink
            .device_online(&self.device_key, peer_ip.as_deref())
            .await;

        let mut lines = line_reader(reader);
        while let Some(line) = next_line(&mut lines).await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_object(line.as_bytes()) {
                Some(data) => report_by_key(&self.context, &self.device_key, data).await,
                None => {
                    debug!(target: "gw.tcp", device_key = %self.device_key, line, "tcp_line_not_json");
                }
            }
        }
        info!(target: "gw.tcp", device_key = %self.device_key, "tcp_connection_closed");
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for TcpDirectDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.base.start_with(|| self.on_start()).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.base.stop_with(|| self.on_stop()).await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    /// 发送 `command` 行；设备应答经上报通道到达。
    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        let command = params
            .get("command")
            .and_then(|value| value.as_str())
            .ok_or_else(|| DriverError::Config("read requires a command".to_string()))?;
        if !self.send_line(device_key, command).await? {
            return Err(DriverError::Transport(format!("device not connected: {device_key}")));
        }
        let mut result = DataMap::new();
        result.insert("sent".to_string(), json!(true));
        Ok(result)
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let line = serde_json::to_string(data).map_err(DriverError::transport)?;
        let sent = self.send_line(device_key, &line).await?;
        if sent {
            info!(target: "gw.tcp", device_key, bytes = line.len(), "tcp_data_written");
        }
        Ok(sent)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        self.writers.read().await.contains_key(device_key)
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}
