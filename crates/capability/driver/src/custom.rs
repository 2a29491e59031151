//! 自定义协议处理器与插件注册表。
//!
//! 处理器在进程初始化时按名称注册，CUSTOM 驱动启动时按 `handlerName` 解析一次。

use crate::error::DriverError;
use domain::DataMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 自定义协议处理器。
pub trait CustomProtocolHandler: Send + Sync {
    /// 驱动启动时调用，传入 `customConfig`
    fn init(&self, config: &DataMap) -> Result<(), DriverError>;

    /// 原始字节 → 属性数据
    fn parse_data(
        &self,
        device_key: &str,
        raw: &[u8],
        context: Option<&DataMap>,
    ) -> Result<DataMap, DriverError>;

    /// 下行数据 → 原始字节
    fn encode_data(
        &self,
        device_key: &str,
        data: &DataMap,
        context: Option<&DataMap>,
    ) -> Result<Vec<u8>, DriverError>;

    fn read_data(
        &self,
        _device_key: &str,
        _params: &DataMap,
        _context: Option<&DataMap>,
    ) -> Result<DataMap, DriverError> {
        Err(DriverError::Unsupported(
            "custom handler does not implement read_data".to_string(),
        ))
    }

    fn is_online(&self, device_key: &str) -> bool;

    /// 驱动停止时调用
    fn destroy(&self);
}

pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn CustomProtocolHandler> + Send + Sync>;

/// 处理器工厂注册表（名称 → 工厂）。
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn CustomProtocolHandler> + Send + Sync + 'static,
    {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(name.to_string(), Arc::new(factory));
        }
    }

    /// 按名称创建处理器实例
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn CustomProtocolHandler>> {
        let factories = self.factories.read().ok()?;
        factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .map(|factories| factories.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
