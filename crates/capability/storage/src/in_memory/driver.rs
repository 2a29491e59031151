//! 驱动配置/状态与驱动审计内存存储实现

use crate::error::StorageError;
use crate::models::DriverLogRecord;
use crate::traits::{DriverLogStore, DriverStore};
use domain::{DriverConfig, DriverStatus};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone)]
struct Entry {
    config: DriverConfig,
    status: DriverStatus,
}

pub struct InMemoryDriverStore {
    drivers: RwLock<HashMap<String, Entry>>,
}

impl InMemoryDriverStore {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// 新增或覆盖驱动配置
    pub fn upsert(&self, config: DriverConfig, status: DriverStatus) -> Result<(), StorageError> {
        let mut map = self
            .drivers
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        map.insert(config.driver_id.clone(), Entry { config, status });
        Ok(())
    }
}

impl Default for InMemoryDriverStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DriverStore for InMemoryDriverStore {
    async fn find_config(&self, driver_id: &str) -> Result<Option<DriverConfig>, StorageError> {
        let map = self
            .drivers
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(driver_id).map(|entry| entry.config.clone()))
    }

    async fn list_by_status(
        &self,
        status: DriverStatus,
    ) -> Result<Vec<DriverConfig>, StorageError> {
        let map = self
            .drivers
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        let mut items: Vec<DriverConfig> = map
            .values()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.config.clone())
            .collect();
        items.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        Ok(items)
    }

    async fn update_status(
        &self,
        driver_id: &str,
        status: DriverStatus,
    ) -> Result<(), StorageError> {
        let mut map = self
            .drivers
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        match map.get_mut(driver_id) {
            Some(entry) => {
                entry.status = status;
                Ok(())
            }
            None => Err(StorageError::new(format!("driver not found: {}", driver_id))),
        }
    }

    async fn get_status(&self, driver_id: &str) -> Result<Option<DriverStatus>, StorageError> {
        let map = self
            .drivers
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(driver_id).map(|entry| entry.status))
    }
}

pub struct InMemoryDriverLogStore {
    logs: RwLock<Vec<DriverLogRecord>>,
}

impl InMemoryDriverLogStore {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(Vec::new()),
        }
    }

    pub fn logs(&self) -> Vec<DriverLogRecord> {
        self.logs
            .read()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryDriverLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DriverLogStore for InMemoryDriverLogStore {
    async fn append(&self, record: DriverLogRecord) -> Result<(), StorageError> {
        let mut items = self
            .logs
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        items.push(record);
        Ok(())
    }
}
