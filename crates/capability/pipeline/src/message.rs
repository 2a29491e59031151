//! 队列消息类型与处理器接口。

use async_trait::async_trait;
use domain::{DataMap, now_epoch_ms};

/// 设备数据消息（写时序）。
#[derive(Debug, Clone)]
pub struct DeviceDataMessage {
    pub device_key: String,
    pub data: DataMap,
    pub timestamp_ms: i64,
}

impl DeviceDataMessage {
    pub fn new(device_key: impl Into<String>, data: DataMap) -> Self {
        Self {
            device_key: device_key.into(),
            data,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

/// 告警消息；priority 越大越先出队。
#[derive(Debug, Clone)]
pub struct AlarmMessage {
    /// 告警类型，如 `DEVICE_OFFLINE`、`alarm`
    pub alarm_type: String,
    pub alarm_data: DataMap,
    pub priority: u8,
    pub timestamp_ms: i64,
}

impl AlarmMessage {
    pub fn new(alarm_type: impl Into<String>, alarm_data: DataMap, priority: u8) -> Self {
        Self {
            alarm_type: alarm_type.into(),
            alarm_data,
            priority,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

/// 规则触发消息。
#[derive(Debug, Clone)]
pub struct RuleTriggerMessage {
    /// 触发源标识（通常为设备 ID）
    pub source_id: String,
    pub trigger_data: DataMap,
    pub timestamp_ms: i64,
}

impl RuleTriggerMessage {
    pub fn new(source_id: impl Into<String>, trigger_data: DataMap) -> Self {
        Self {
            source_id: source_id.into(),
            trigger_data,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

/// 通知消息。
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    /// 通知渠道，如 `email`
    pub notification_type: String,
    pub data: DataMap,
    pub timestamp_ms: i64,
}

impl NotificationMessage {
    pub fn new(notification_type: impl Into<String>, data: DataMap) -> Self {
        Self {
            notification_type: notification_type.into(),
            data,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

/// 设备下行指令消息。
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub device_key: String,
    pub command: DataMap,
    pub timestamp_ms: i64,
}

impl CommandMessage {
    pub fn new(device_key: impl Into<String>, command: DataMap) -> Self {
        Self {
            device_key: device_key.into(),
            command,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

/// 处理器错误；只记录日志，不影响消费线程。
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// 队列消费处理器。
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync {
    async fn handle(&self, message: M) -> Result<(), HandlerError>;
}
