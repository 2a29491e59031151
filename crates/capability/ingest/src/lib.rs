//! # 设备消息接入能力模块
//!
//! 协议层（MQTT 接入端点、各驱动）把设备消息交给 `DeviceMessageService`，
//! 之后的处理都在本模块：
//!
//! ```text
//! DeviceMessageService (DeviceMessageSink)
//!       │  按 Topic 类别分发
//!       ├── property / event / response ──► DeviceDataHandler
//!       └── gateway / topo ──► GatewayTopologyRouter ──► DeviceDataHandler
//!
//! DeviceDataHandler
//!       ├── 变化检测 → 北向推送（NorthboundPush）
//!       ├── 设备数据队列 / 告警队列（gw-pipeline）
//!       ├── 实时推送（LivePush）
//!       └── 时序写入、影子合并与审计行（每秒批量刷新）
//! ```
//!
//! 每个扇出步骤单独处理失败，不影响其余步骤。

pub mod consumers;
pub mod handler;
pub mod northbound;
pub mod push;
pub mod service;
pub mod topology;

pub use consumers::{
    AlarmConsumer, CommandConsumer, DeviceDataConsumer, LoggingNotifier, LoggingRuleEvaluator,
    NotificationConsumer, Notifier, RuleConsumer, RuleEvaluator, register_consumers,
};
pub use handler::{DeviceDataHandler, IngestConfig, IngestStores};
pub use northbound::{MqttNorthbound, NorthboundConfig};
pub use push::{BroadcastLivePush, LivePush, NoopLivePush, NoopNorthbound, NorthboundPush};
pub use service::DeviceMessageService;
pub use topology::GatewayTopologyRouter;

use gw_storage::StorageError;

/// 接入处理错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("northbound error: {0}")]
    Northbound(String),
    #[error("rule evaluation error: {0}")]
    Rule(String),
    #[error("notification error: {0}")]
    Notify(String),
}
