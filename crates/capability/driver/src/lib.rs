//! # 驱动能力模块
//!
//! - `contract`：设备驱动契约 `DeviceDriver` 与公共生命周期状态 `DriverBase`
//! - `context`：注入驱动的共享依赖（存储、上行接收方、下行通道、插件）
//! - `registry`：类型标签 → 构造函数
//! - `manager`：驱动生命周期管理（启停、重启、自动加载、运行时长、审计）
//! - `custom`：自定义协议处理器插件注册表
//!
//! 具体协议驱动在 `gw-protocol` 中实现并注册。

pub mod context;
pub mod contract;
pub mod custom;
pub mod error;
pub mod manager;
pub mod registry;

pub use context::{DeviceDownlink, DeviceMessageSink, DriverContext, DriverTuning, NoopMessageSink};
pub use contract::{DeviceDriver, DriverBase};
pub use custom::{CustomProtocolHandler, HandlerFactory, PluginRegistry};
pub use error::DriverError;
pub use manager::DriverManager;
pub use registry::{DriverDescriptor, DriverFactory, DriverRegistry};
