//! 实时推送与北向推送协作方接口。

use crate::IngestError;
use async_trait::async_trait;
use domain::{DataMap, Device, DeviceStatus};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// 实时推送（看板等订阅方）；失败静默丢弃。
pub trait LivePush: Send + Sync {
    /// 推送 `{type, deviceId, deviceKey, ..., timestamp}` 信封
    fn push(&self, message: Value);
}

/// 北向推送（外部系统同步调用）。
#[async_trait]
pub trait NorthboundPush: Send + Sync {
    async fn push_data(&self, device: &Device, data: &DataMap) -> Result<(), IngestError>;

    async fn push_event(&self, device: &Device, data: &DataMap) -> Result<(), IngestError>;

    async fn push_status(&self, device: &Device, status: DeviceStatus) -> Result<(), IngestError>;
}

#[derive(Debug, Default)]
pub struct NoopLivePush;

impl LivePush for NoopLivePush {
    fn push(&self, _message: Value) {}
}

#[derive(Debug, Default)]
pub struct NoopNorthbound;

#[async_trait]
impl NorthboundPush for NoopNorthbound {
    async fn push_data(&self, _device: &Device, _data: &DataMap) -> Result<(), IngestError> {
        Ok(())
    }

    async fn push_event(&self, _device: &Device, _data: &DataMap) -> Result<(), IngestError> {
        Ok(())
    }

    async fn push_status(&self, _device: &Device, _status: DeviceStatus) -> Result<(), IngestError> {
        Ok(())
    }
}

/// 基于 broadcast 通道的实时推送；订阅方落后时丢弃旧消息。
pub struct BroadcastLivePush {
    tx: broadcast::Sender<Value>,
}

impl BroadcastLivePush {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl LivePush for BroadcastLivePush {
    fn push(&self, message: Value) {
        if self.tx.send(message).is_err() {
            trace!(target: "gw.ingest", "live_push_no_subscriber");
        }
    }
}
