//! DTU_GATEWAY 驱动：TCP 服务端，DTU 主动连入。
//!
//! 连接的首行是注册报文（`REG:{deviceKey}` 或 `{"deviceKey": ...}`），
//! 之后每行一个 JSON 对象作为属性上报；下行按 deviceKey 找到注册的连接写入。

use super::{LineReader, TaskSet, line_reader, next_line, parse_object, report_by_key};
use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DRIVER_TYPE: &str = "DTU_GATEWAY";
pub const DEFAULT_PORT: u16 = 9000;
const REGISTER_PREFIX: &str = "REG:";

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "DTU网关驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(DtuGatewayDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("port", "监听端口", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_PORT))
            .range(1, 65535)
            .required(),
    ]
}

/// 注册报文：返回 deviceKey 与随注册报文携带的属性。
pub fn parse_registration(line: &str) -> Option<(String, DataMap)> {
    let line = line.trim();
    if let Some(key) = line.strip_prefix(REGISTER_PREFIX) {
        let key = key.trim();
        return (!key.is_empty()).then(|| (key.to_string(), DataMap::new()));
    }
    let mut object = parse_object(line.as_bytes())?;
    let key = match object.remove("deviceKey")? {
        Value::String(key) if !key.is_empty() => key,
        _ => return None,
    };
    Some((key, object))
}

#[derive(Debug, Clone)]
struct Registration {
    connection_id: String,
    tx: mpsc::UnboundedSender<String>,
}

type Registry = Arc<RwLock<HashMap<String, Registration>>>;

pub struct DtuGatewayDriver {
    base: DriverBase,
    context: DriverContext,
    port: u16,
    channels: Registry,
    local_addr: RwLock<Option<SocketAddr>>,
    tasks: TaskSet,
}

impl DtuGatewayDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let port = config.get_u16_or("port", DEFAULT_PORT);
        Self {
            base: DriverBase::new(config),
            context,
            port,
            channels: Arc::new(RwLock::new(HashMap::new())),
            local_addr: RwLock::new(None),
            tasks: TaskSet::default(),
        }
    }

    /// 实际监听地址（端口配置为 0 时由系统分配）。
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn registered_devices(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.channels.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|err| DriverError::Transport(format!("bind port {}: {err}", self.port)))?;
        let addr = listener.local_addr().map_err(DriverError::transport)?;
        *self.local_addr.write().await = Some(addr);
        info!(target: "gw.tcp", addr = %addr, "dtu_listener_started");

        let channels = Arc::clone(&self.channels);
        let context = self.context.clone();
        self.tasks.push(tokio::spawn(async move {
            // 接入任务被中止时随 JoinSet 一起中止全部会话
            let mut sessions = JoinSet::new();
            loop {
                while sessions.try_join_next().is_some() {}
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(target: "gw.tcp", peer = %peer, "dtu_connection_accepted");
                        let session = DtuSession {
                            connection_id: gw_telemetry::new_connection_id(),
                            peer,
                            channels: Arc::clone(&channels),
                            context: context.clone(),
                        };
                        sessions.spawn(async move {
                            if let Err(err) = session.run(stream).await {
                                warn!(target: "gw.tcp", peer = %peer, error = %err, "dtu_connection_error");
                            }
                        });
                    }
                    Err(err) => {
                        error!(target: "gw.tcp", error = %err, "dtu_accept_failed");
                    }
                }
            }
        }));
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        // 丢弃发送端后写任务结束并关闭连接
        let keys: Vec<String> = self.channels.write().await.drain().map(|(key, _)| key).collect();
        for key in keys {
            self.context.sink.device_offline(&key).await;
        }
        *self.local_addr.write().await = None;
        Ok(())
    }
}

struct DtuSession {
    connection_id: String,
    peer: SocketAddr,
    channels: Registry,
    context: DriverContext,
}

impl DtuSession {
    async fn run(self, stream: TcpStream) -> Result<(), ProtocolError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = line_reader(reader);

        let (device_key, initial) = loop {
            let Some(line) = next_line(&mut lines).await? else {
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_registration(&line) {
                Some(registration) => break registration,
                None => {
                    warn!(target: "gw.tcp", peer = %self.peer, "dtu_registration_invalid");
                    return Ok(());
                }
            }
        };
        match self.context.devices.find_by_key(&device_key).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(target: "gw.tcp", device_key = %device_key, peer = %self.peer, "dtu_device_unknown");
                return Ok(());
            }
            Err(err) => return Err(ProtocolError::Connection(err.to_string())),
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.channels.write().await.insert(
            device_key.clone(),
            Registration {
                connection_id: self.connection_id.clone(),
                tx,
            },
        );
        info!(target: "gw.tcp", device_key = %device_key, peer = %self.peer, "dtu_device_registered");
        let ip = self.peer.ip().to_string();
        self.context.sink.device_online(&device_key, Some(ip.as_str())).await;
        report_by_key(&self.context, &device_key, initial).await;

        let write_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let result = self.read_loop(&mut lines, &device_key).await;
        write_task.abort();

        let owned = {
            let mut channels = self.channels.write().await;
            let owned = channels
                .get(&device_key)
                .is_some_and(|registration| registration.connection_id == self.connection_id);
            if owned {
                channels.remove(&device_key);
            }
            owned
        };
        if owned {
            info!(target: "gw.tcp", device_key = %device_key, "dtu_device_disconnected");
            self.context.sink.device_offline(&device_key).await;
        }
        result
    }

    async fn read_loop(
        &self,
        lines: &mut LineReader<tokio::net::tcp::OwnedReadHalf>,
        device_key: &str,
    ) -> Result<(), ProtocolError> {
        while let Some(line) = next_line(lines).await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_object(line.as_bytes()) {
                Some(mut data) => {
                    data.remove("deviceKey");
                    report_by_key(&self.context, device_key, data).await;
                }
                None => {
                    debug!(target: "gw.tcp", device_key, line, "dtu_line_not_json");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for DtuGatewayDriver {
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

    /// DTU 主动上报，没有拉取语义。
    async fn read_data(&self, _device_key: &str, _params: &DataMap) -> Result<DataMap, DriverError> {
        Err(DriverError::Unsupported("dtu devices report data actively".to_string()))
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let Some(registration) = self.channels.read().await.get(device_key).cloned() else {
            warn!(target: "gw.tcp", device_key, "dtu_device_not_registered");
            return Ok(false);
        };
        let mut line = serde_json::to_string(data).map_err(DriverError::transport)?;
        line.push('\n');
        let sent = registration.tx.send(line).is_ok();
        if sent {
            info!(target: "gw.tcp", device_key, "dtu_command_sent");
        }
        Ok(sent)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        self.channels.read().await.contains_key(device_key)
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_accepts_prefix_and_json() {
        assert_eq!(
            parse_registration("REG:dtu-001\r"),
            Some(("dtu-001".to_string(), DataMap::new()))
        );
        let (key, data) = parse_registration(r#"{"deviceKey":"dtu-002","temp":21.5}"#)
            .expect("json registration");
        assert_eq!(key, "dtu-002");
        assert_eq!(data.get("temp"), Some(&json!(21.5)));
    }

    #[test]
    fn registration_rejects_missing_key() {
        assert!(parse_registration("REG:").is_none());
        assert!(parse_registration(r#"{"temp":1}"#).is_none());
        assert!(parse_registration(r#"{"deviceKey":""}"#).is_none());
        assert!(parse_registration("hello").is_none());
    }
}
