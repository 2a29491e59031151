//! 协议错误类型定义

use gw_driver::DriverError;

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Modbus 错误
    #[error("modbus error: {0}")]
    Modbus(String),

    /// S7 报文或应答错误
    #[error("s7 error: {0}")]
    S7(String),

    /// MQTT 报文错误
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,

    /// 连接池已满
    #[error("connection pool full ({0})")]
    PoolFull(usize),
}

impl From<ProtocolError> for DriverError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConfigParse(message) => DriverError::Config(message),
            other => DriverError::Transport(other.to_string()),
        }
    }
}
