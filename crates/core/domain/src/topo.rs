use serde::{Deserialize, Serialize};

/// 网关拓扑边：网关 → 子设备绑定关系。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopoEdge {
    pub gateway_id: String,
    pub sub_device_id: String,
    pub bind_time_ms: i64,
}
