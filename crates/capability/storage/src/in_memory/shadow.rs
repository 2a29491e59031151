//! 设备影子内存存储实现

use crate::error::StorageError;
use crate::traits::ShadowStore;
use domain::DeviceShadow;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct InMemoryShadowStore {
    shadows: RwLock<HashMap<String, DeviceShadow>>,
    batches: AtomicU64,
}

impl InMemoryShadowStore {
    pub fn new() -> Self {
        Self {
            shadows: RwLock::new(HashMap::new()),
            batches: AtomicU64::new(0),
        }
    }

    /// 已执行的批量保存次数
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ShadowStore for InMemoryShadowStore {
    async fn find_shadow(&self, device_id: &str) -> Result<Option<DeviceShadow>, StorageError> {
        let map = self
            .shadows
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(device_id).cloned())
    }

    async fn save_batch(&self, shadows: Vec<DeviceShadow>) -> Result<(), StorageError> {
        let mut map = self
            .shadows
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        for shadow in shadows {
            map.insert(shadow.device_id.clone(), shadow);
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
