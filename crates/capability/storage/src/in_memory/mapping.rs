//! 寄存器映射内存存储实现

use crate::error::StorageError;
use crate::traits::MappingStore;
use domain::PropertyMapping;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct InMemoryMappingStore {
    device: RwLock<HashMap<String, Vec<PropertyMapping>>>,
    product: RwLock<HashMap<String, Vec<PropertyMapping>>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self {
            device: RwLock::new(HashMap::new()),
            product: RwLock::new(HashMap::new()),
        }
    }

    /// 设置设备级映射（覆盖）
    pub fn set_device_mappings(
        &self,
        device_id: &str,
        mappings: Vec<PropertyMapping>,
    ) -> Result<(), StorageError> {
        let mut map = self
            .device
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        map.insert(device_id.to_string(), mappings);
        Ok(())
    }

    /// 设置产品级映射（覆盖）
    pub fn set_product_mappings(
        &self,
        product_id: &str,
        mappings: Vec<PropertyMapping>,
    ) -> Result<(), StorageError> {
        let mut map = self
            .product
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        map.insert(product_id.to_string(), mappings);
        Ok(())
    }
}

impl Default for InMemoryMappingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn device_mappings(
        &self,
        device_id: &str,
    ) -> Result<Vec<PropertyMapping>, StorageError> {
        let map = self
            .device
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(device_id).cloned().unwrap_or_default())
    }

    async fn product_mappings(
        &self,
        product_id: &str,
    ) -> Result<Vec<PropertyMapping>, StorageError> {
        let map = self
            .product
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(product_id).cloned().unwrap_or_default())
    }
}
