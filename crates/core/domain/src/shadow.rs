//! 设备影子：最近一次上报状态的尽力缓存。

use crate::DataMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceShadow {
    pub device_id: String,
    pub reported: DataMap,
    pub desired: DataMap,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl DeviceShadow {
    /// 首次创建，版本号为 1。
    pub fn new(device_id: impl Into<String>, reported: DataMap, now_ms: i64) -> Self {
        Self {
            device_id: device_id.into(),
            reported,
            desired: DataMap::new(),
            version: 1,
            updated_at_ms: now_ms,
        }
    }

    /// 合并上报值并递增版本号。
    pub fn merge_reported(&mut self, patch: &DataMap, now_ms: i64) {
        for (key, value) in patch {
            self.reported.insert(key.clone(), value.clone());
        }
        self.version += 1;
        self.updated_at_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_untouched_keys() {
        let first = json!({"temp": 20, "hum": 40}).as_object().cloned().unwrap_or_default();
        let mut shadow = DeviceShadow::new("d-1", first, 1);
        let patch = json!({"temp": 21}).as_object().cloned().unwrap_or_default();
        shadow.merge_reported(&patch, 2);
        assert_eq!(shadow.version, 2);
        assert_eq!(shadow.reported["temp"], json!(21));
        assert_eq!(shadow.reported["hum"], json!(40));
    }
}
