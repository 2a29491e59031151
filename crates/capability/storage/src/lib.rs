//! # 网关存储协作方
//!
//! 网关核心不拥有设备/产品/规则的持久化模式，只通过本模块定义的异步接口读写：
//!
//! 1. **接口抽象层** (`traits.rs`)：设备、映射、拓扑、影子、审计、时序、驱动
//! 2. **数据模型层** (`models.rs`)：审计行、时序点、驱动日志
//! 3. **错误处理层** (`error.rs`)：统一的存储错误类型
//! 4. **实现层** (`in_memory/`)：`RwLock<HashMap>` 内存实现
//! 5. **初始化层** (`bootstrap.rs`)：从 JSON 文件装载内存存储
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use gw_storage::{BootstrapData, InMemoryStores, DeviceStore};
//!
//! let data = BootstrapData::from_file("bootstrap.json")?;
//! let stores = InMemoryStores::from_bootstrap(data).await?;
//! let device = stores.devices.find_by_key("meter-01").await?;
//! ```

pub mod bootstrap;
pub mod error;
pub mod in_memory;
pub mod models;
pub mod traits;

pub use bootstrap::*;
pub use error::*;
pub use models::*;
pub use traits::*;

pub use in_memory::{
    InMemoryDeviceDataStore, InMemoryDeviceStore, InMemoryDriverLogStore, InMemoryDriverStore,
    InMemoryMappingStore, InMemoryShadowStore, InMemoryTimeSeriesStore, InMemoryTopoStore,
};
