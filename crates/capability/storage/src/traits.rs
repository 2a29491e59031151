//! 存储接口 Trait 定义
//!
//! 网关核心只通过这些接口与外部协作方交互：
//! - DeviceStore：设备查询与状态回写
//! - MappingStore：设备级/产品级寄存器映射
//! - TopoStore：网关拓扑边
//! - ShadowStore：设备影子
//! - DeviceDataStore：审计行批量写入
//! - TimeSeriesStore：时序写入
//! - DriverStore / DriverLogStore：驱动配置、状态与审计
//!
//! 设计原则：
//! - 所有接口返回 StorageError
//! - 使用 async_trait 支持动态分发

use crate::error::StorageError;
use crate::models::{DeviceDataRecord, DriverLogRecord, TimeSeriesPoint};
use async_trait::async_trait;
use domain::{
    Device, DeviceShadow, DeviceStatus, DriverConfig, DriverStatus, PropertyMapping, TopoEdge,
    resolve_mappings,
};

/// 设备存储接口
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// 根据设备标识查找设备
    async fn find_by_key(&self, device_key: &str) -> Result<Option<Device>, StorageError>;

    async fn find_by_id(&self, device_id: &str) -> Result<Option<Device>, StorageError>;

    /// 列出绑定到指定驱动的设备
    async fn list_by_driver(&self, driver_id: &str) -> Result<Vec<Device>, StorageError>;

    /// 更新设备状态；ONLINE 时同时写入最近上线时间与首次激活时间
    async fn update_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now_ms: i64,
    ) -> Result<Option<Device>, StorageError>;

    /// 新增或覆盖设备
    async fn save_device(&self, device: Device) -> Result<(), StorageError>;
}

/// 寄存器映射存储接口
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn device_mappings(&self, device_id: &str)
    -> Result<Vec<PropertyMapping>, StorageError>;

    async fn product_mappings(
        &self,
        product_id: &str,
    ) -> Result<Vec<PropertyMapping>, StorageError>;

    /// 解析设备生效映射（设备级优先，缺省继承产品级）
    async fn resolve(&self, device: &Device) -> Result<Vec<PropertyMapping>, StorageError> {
        let device_level = self.device_mappings(&device.id).await?;
        let product_level = self.product_mappings(&device.product_id).await?;
        Ok(resolve_mappings(device_level, product_level))
    }
}

/// 网关拓扑存储接口
#[async_trait]
pub trait TopoStore: Send + Sync {
    async fn find_edge(
        &self,
        gateway_id: &str,
        sub_device_id: &str,
    ) -> Result<Option<TopoEdge>, StorageError>;

    /// 绑定子设备（已存在则刷新绑定时间）
    async fn bind(&self, edge: TopoEdge) -> Result<(), StorageError>;

    /// 解绑子设备，返回是否存在
    async fn unbind(&self, gateway_id: &str, sub_device_id: &str) -> Result<bool, StorageError>;

    async fn list_sub_devices(&self, gateway_id: &str) -> Result<Vec<TopoEdge>, StorageError>;
}

/// 设备影子存储接口
#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn find_shadow(&self, device_id: &str) -> Result<Option<DeviceShadow>, StorageError>;

    /// 批量保存（新增或覆盖）
    async fn save_batch(&self, shadows: Vec<DeviceShadow>) -> Result<(), StorageError>;
}

/// 审计行存储接口
#[async_trait]
pub trait DeviceDataStore: Send + Sync {
    async fn save_batch(&self, records: Vec<DeviceDataRecord>) -> Result<(), StorageError>;
}

/// 时序存储接口
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_point(&self, point: TimeSeriesPoint) -> Result<(), StorageError>;
}

/// 驱动配置与状态存储接口
#[async_trait]
pub trait DriverStore: Send + Sync {
    async fn find_config(&self, driver_id: &str) -> Result<Option<DriverConfig>, StorageError>;

    async fn list_by_status(&self, status: DriverStatus)
    -> Result<Vec<DriverConfig>, StorageError>;

    async fn update_status(&self, driver_id: &str, status: DriverStatus)
    -> Result<(), StorageError>;

    async fn get_status(&self, driver_id: &str) -> Result<Option<DriverStatus>, StorageError>;
}

/// 驱动审计日志存储接口
#[async_trait]
pub trait DriverLogStore: Send + Sync {
    async fn append(&self, record: DriverLogRecord) -> Result<(), StorageError>;
}
