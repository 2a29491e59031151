//! 设备内存存储实现
//!
//! 用于测试、演示以及无外部数据库时的本地运行。

use crate::error::StorageError;
use crate::traits::DeviceStore;
use domain::{Device, DeviceStatus};
use std::collections::HashMap;
use std::sync::RwLock;

/// 设备内存存储
///
/// 使用 RwLock + HashMap 提供线程安全的内存存储，按设备 ID 索引。
pub struct InMemoryDeviceStore {
    devices: RwLock<HashMap<String, Device>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        let map = devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();
        Self {
            devices: RwLock::new(map),
        }
    }
}

impl Default for InMemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn find_by_key(&self, device_key: &str) -> Result<Option<Device>, StorageError> {
        let map = self
            .devices
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map
            .values()
            .find(|item| item.device_key == device_key)
            .cloned())
    }

    async fn find_by_id(&self, device_id: &str) -> Result<Option<Device>, StorageError> {
        let map = self
            .devices
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(device_id).cloned())
    }

    async fn list_by_driver(&self, driver_id: &str) -> Result<Vec<Device>, StorageError> {
        let map = self
            .devices
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        let mut items: Vec<Device> = map
            .values()
            .filter(|item| item.driver_id.as_deref() == Some(driver_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.device_key.cmp(&b.device_key));
        Ok(items)
    }

    async fn update_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now_ms: i64,
    ) -> Result<Option<Device>, StorageError> {
        let mut map = self
            .devices
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        let Some(device) = map.get_mut(device_id) else {
            return Ok(None);
        };
        if status == DeviceStatus::Online {
            device.mark_online(now_ms);
        } else {
            device.status = status;
        }
        Ok(Some(device.clone()))
    }

    async fn save_device(&self, device: Device) -> Result<(), StorageError> {
        let mut map = self
            .devices
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        map.insert(device.id.clone(), device);
        Ok(())
    }
}
