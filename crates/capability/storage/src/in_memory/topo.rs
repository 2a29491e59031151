//! 网关拓扑内存存储实现

use crate::error::StorageError;
use crate::traits::TopoStore;
use domain::TopoEdge;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct InMemoryTopoStore {
    edges: RwLock<HashMap<String, TopoEdge>>,
}

impl InMemoryTopoStore {
    pub fn new() -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTopoStore {
    fn default() -> Self {
        Self::new()
    }
}

fn edge_key(gateway_id: &str, sub_device_id: &str) -> String {
    format!("gateway:{}:sub:{}", gateway_id, sub_device_id)
}

#[async_trait::async_trait]
impl TopoStore for InMemoryTopoStore {
    async fn find_edge(
        &self,
        gateway_id: &str,
        sub_device_id: &str,
    ) -> Result<Option<TopoEdge>, StorageError> {
        let map = self
            .edges
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.get(&edge_key(gateway_id, sub_device_id)).cloned())
    }

    async fn bind(&self, edge: TopoEdge) -> Result<(), StorageError> {
        let mut map = self
            .edges
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        map.insert(edge_key(&edge.gateway_id, &edge.sub_device_id), edge);
        Ok(())
    }

    async fn unbind(&self, gateway_id: &str, sub_device_id: &str) -> Result<bool, StorageError> {
        let mut map = self
            .edges
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(map.remove(&edge_key(gateway_id, sub_device_id)).is_some())
    }

    async fn list_sub_devices(&self, gateway_id: &str) -> Result<Vec<TopoEdge>, StorageError> {
        let map = self
            .edges
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        let mut items: Vec<TopoEdge> = map
            .values()
            .filter(|edge| edge.gateway_id == gateway_id)
            .cloned()
            .collect();
        items.sort_by_key(|edge| edge.bind_time_ms);
        Ok(items)
    }
}
