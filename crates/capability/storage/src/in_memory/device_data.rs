//! 审计行与时序内存存储实现

use crate::error::StorageError;
use crate::models::{DeviceDataRecord, TimeSeriesPoint};
use crate::traits::{DeviceDataStore, TimeSeriesStore};
use std::sync::RwLock;

pub struct InMemoryDeviceDataStore {
    records: RwLock<Vec<DeviceDataRecord>>,
}

impl InMemoryDeviceDataStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<DeviceDataRecord> {
        self.records
            .read()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryDeviceDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DeviceDataStore for InMemoryDeviceDataStore {
    async fn save_batch(&self, records: Vec<DeviceDataRecord>) -> Result<(), StorageError> {
        let mut items = self
            .records
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        items.extend(records);
        Ok(())
    }
}

pub struct InMemoryTimeSeriesStore {
    points: RwLock<Vec<TimeSeriesPoint>>,
}

impl InMemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(Vec::new()),
        }
    }

    pub fn points(&self) -> Vec<TimeSeriesPoint> {
        self.points
            .read()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryTimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn write_point(&self, point: TimeSeriesPoint) -> Result<(), StorageError> {
        let mut items = self
            .points
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        items.push(point);
        Ok(())
    }
}
