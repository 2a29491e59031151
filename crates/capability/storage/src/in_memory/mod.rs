//! 内存存储实现模块
//!
//! 用于测试与无外部数据库时的本地运行。
//!
//! 包含以下实现：
//! - DeviceStore: InMemoryDeviceStore
//! - MappingStore: InMemoryMappingStore
//! - TopoStore: InMemoryTopoStore
//! - ShadowStore: InMemoryShadowStore
//! - DeviceDataStore / TimeSeriesStore: InMemoryDeviceDataStore / InMemoryTimeSeriesStore
//! - DriverStore / DriverLogStore: InMemoryDriverStore / InMemoryDriverLogStore

pub mod device;
pub mod device_data;
pub mod driver;
pub mod mapping;
pub mod shadow;
pub mod topo;

pub use device::*;
pub use device_data::*;
pub use driver::*;
pub use mapping::*;
pub use shadow::*;
pub use topo::*;
