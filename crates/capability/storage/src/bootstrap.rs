//! 内存存储初始化数据
//!
//! 从 JSON 文件装载设备、映射、拓扑与驱动配置，供无外部配置中心时运行。

use crate::error::StorageError;
use crate::in_memory::{
    InMemoryDeviceDataStore, InMemoryDeviceStore, InMemoryDriverLogStore, InMemoryDriverStore,
    InMemoryMappingStore, InMemoryShadowStore, InMemoryTimeSeriesStore, InMemoryTopoStore,
};
use crate::traits::TopoStore;
use domain::{Device, DriverConfig, DriverStatus, PropertyMapping, TopoEdge};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// 驱动初始化项：驱动配置 + 持久化状态。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSeed {
    #[serde(flatten)]
    pub config: DriverConfig,
    #[serde(default)]
    pub status: DriverStatus,
}

/// 初始化数据文件结构。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapData {
    #[serde(default)]
    pub devices: Vec<Device>,
    /// deviceId → 映射
    #[serde(default)]
    pub device_mappings: HashMap<String, Vec<PropertyMapping>>,
    /// productId → 映射
    #[serde(default)]
    pub product_mappings: HashMap<String, Vec<PropertyMapping>>,
    #[serde(default)]
    pub topology: Vec<TopoEdge>,
    #[serde(default)]
    pub drivers: Vec<DriverSeed>,
}

impl BootstrapData {
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &str) -> Result<Self, StorageError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// 全部内存存储的集合。
#[derive(Clone)]
pub struct InMemoryStores {
    pub devices: Arc<InMemoryDeviceStore>,
    pub mappings: Arc<InMemoryMappingStore>,
    pub topology: Arc<InMemoryTopoStore>,
    pub shadows: Arc<InMemoryShadowStore>,
    pub device_data: Arc<InMemoryDeviceDataStore>,
    pub time_series: Arc<InMemoryTimeSeriesStore>,
    pub drivers: Arc<InMemoryDriverStore>,
    pub driver_logs: Arc<InMemoryDriverLogStore>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(InMemoryDeviceStore::new()),
            mappings: Arc::new(InMemoryMappingStore::new()),
            topology: Arc::new(InMemoryTopoStore::new()),
            shadows: Arc::new(InMemoryShadowStore::new()),
            device_data: Arc::new(InMemoryDeviceDataStore::new()),
            time_series: Arc::new(InMemoryTimeSeriesStore::new()),
            drivers: Arc::new(InMemoryDriverStore::new()),
            driver_logs: Arc::new(InMemoryDriverLogStore::new()),
        }
    }

    /// 由初始化数据构建
    pub async fn from_bootstrap(data: BootstrapData) -> Result<Self, StorageError> {
        let stores = Self::new();
        let devices = InMemoryDeviceStore::with_devices(data.devices);
        let stores = Self {
            devices: Arc::new(devices),
            ..stores
        };
        for (device_id, mappings) in data.device_mappings {
            stores.mappings.set_device_mappings(&device_id, mappings)?;
        }
        for (product_id, mappings) in data.product_mappings {
            stores.mappings.set_product_mappings(&product_id, mappings)?;
        }
        for edge in data.topology {
            stores.topology.bind(edge).await?;
        }
        for seed in data.drivers {
            stores.drivers.upsert(seed.config, seed.status)?;
        }
        Ok(stores)
    }
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self::new()
    }
}
