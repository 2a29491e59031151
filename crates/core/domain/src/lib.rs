//! 网关领域模型：设备、驱动配置、寄存器映射、设备影子、网关拓扑与 Topic 约定。
//!
//! 所有能力模块共享这些类型；这里不包含任何 IO。

pub mod device;
pub mod driver;
pub mod mapping;
pub mod shadow;
pub mod topic;
pub mod topo;

pub use device::{Device, DeviceStatus};
pub use driver::{
    DriverConfig, DriverConfigField, DriverLogType, DriverStatus, FieldLevel, FieldType,
};
pub use mapping::{DataType, PropertyMapping, resolve_mappings};
pub use shadow::DeviceShadow;
pub use topic::{
    DeviceTopic, TopicKind, command_down_topic, property_post_topic, topo_response_topic,
};
pub use topo::TopoEdge;

/// 设备上报的属性/事件数据（JSON 对象）。
pub type DataMap = serde_json::Map<String, serde_json::Value>;

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
