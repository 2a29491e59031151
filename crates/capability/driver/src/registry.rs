//! 驱动类型注册表（类型标签 → 构造函数）。

use crate::context::DriverContext;
use crate::contract::DeviceDriver;
use crate::error::DriverError;
use domain::{DriverConfig, DriverConfigField};
use std::collections::HashMap;
use std::sync::Arc;

pub type DriverFactory =
    fn(DriverConfig, DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError>;

/// 驱动类型描述。
#[derive(Clone, Copy)]
pub struct DriverDescriptor {
    pub driver_type: &'static str,
    pub display_name: &'static str,
    pub factory: DriverFactory,
    pub fields: fn() -> Vec<DriverConfigField>,
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    descriptors: HashMap<&'static str, DriverDescriptor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: DriverDescriptor) {
        self.descriptors.insert(descriptor.driver_type, descriptor);
    }

    pub fn descriptor(&self, driver_type: &str) -> Option<&DriverDescriptor> {
        self.descriptors.get(driver_type)
    }

    /// 按配置中的类型标签构造驱动实例。
    pub fn create(
        &self,
        config: DriverConfig,
        context: DriverContext,
    ) -> Result<Arc<dyn DeviceDriver>, DriverError> {
        let descriptor = self
            .descriptor(&config.driver_type)
            .ok_or_else(|| DriverError::UnknownType(config.driver_type.clone()))?;
        (descriptor.factory)(config, context)
    }

    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.descriptors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn config_fields(&self, driver_type: &str) -> Option<Vec<DriverConfigField>> {
        self.descriptor(driver_type)
            .map(|descriptor| (descriptor.fields)())
    }
}
