//! # 协议接入能力模块
//!
//! 网关南向的全部协议实现：
//! - **MQTT**：设备直连的 MQTT 3.1/3.1.1 接入端点（TCP 与 WebSocket）
//! - **Modbus TCP**：连接池、批量读取规划与寄存器解码
//! - **S7**：ISO-on-TCP 报文、地址解析与定时采集
//! - **驱动**：`drivers` 下的 11 种内置驱动，统一实现 `DeviceDriver`
//!
//! ## 架构
//!
//! ```text
//! 设备 ──► MqttBroker / 驱动 ──► DeviceMessageSink ──► 消息处理
//!                ▲
//!                └── ProtocolServerManager（按 ID 启停监听）
//! ```

pub mod drivers;
pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod s7;
pub mod server;

pub use drivers::{builtin_registry, register_builtin_drivers};
pub use error::ProtocolError;
pub use mqtt::{BrokerConfig, MqttBroker, SessionManager};
pub use server::{ProtocolServerManager, ServerInfo, ServerKind};
