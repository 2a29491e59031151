//! 设备数据处理：属性、事件、指令响应与状态变化的扇出。
//!
//! 属性路径：
//! 1. 与内存快照比较，有变化才推北向；快照同步合并
//! 2. 设备数据队列（驱动规则引擎）
//! 3. 实时推送
//! 4. 时序写入（后台任务）
//! 5. 影子补丁暂存，由刷新任务按设备合并后批量保存
//!
//! 事件与指令响应写入审计缓冲，缓冲满时立即刷新。

use crate::IngestError;
use crate::push::{LivePush, NorthboundPush};
use domain::{DataMap, Device, DeviceShadow, DeviceStatus, now_epoch_ms};
use gw_pipeline::{AlarmMessage, DeviceDataMessage, MessageQueue};
use gw_storage::{
    DeviceDataRecord, DeviceDataStore, DeviceDataType, ShadowStore, TimeSeriesPoint,
    TimeSeriesStore,
};
use gw_telemetry::{
    record_audit_rows_flushed, record_northbound_failure, record_shadow_flush,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 事件上报中 `eventType = alarm` 的告警优先级
pub const EVENT_ALARM_PRIORITY: u8 = 8;
/// 设备离线告警优先级
pub const OFFLINE_ALARM_PRIORITY: u8 = 5;
pub const OFFLINE_ALARM_TYPE: &str = "DEVICE_OFFLINE";
/// 时序 measurement
pub const MEASUREMENT: &str = "device_data";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// 影子与审计行刷新周期
    pub flush_interval: Duration,
    /// 审计缓冲上限
    pub audit_capacity: usize,
    /// 单次刷新最多写出的审计行
    pub audit_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            audit_capacity: 1000,
            audit_batch: 100,
        }
    }
}

/// 处理器依赖的下游存储。
#[derive(Clone)]
pub struct IngestStores {
    pub shadows: Arc<dyn ShadowStore>,
    pub device_data: Arc<dyn DeviceDataStore>,
    pub time_series: Arc<dyn TimeSeriesStore>,
}

struct PendingShadow {
    device: Device,
    patch: DataMap,
}

pub struct DeviceDataHandler {
    config: IngestConfig,
    stores: IngestStores,
    queue: MessageQueue,
    live: Arc<dyn LivePush>,
    northbound: Arc<dyn NorthboundPush>,
    /// 设备 ID → 最近一次属性快照
    snapshots: Mutex<HashMap<String, DataMap>>,
    pending_shadows: Mutex<HashMap<String, PendingShadow>>,
    audit: Mutex<VecDeque<DeviceDataRecord>>,
    flush_lock: tokio::sync::Mutex<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 实时推送信封。
fn live_envelope(kind: &str, device: &Device, data: Value) -> Value {
    json!({
        "type": kind,
        "deviceId": device.id,
        "deviceKey": device.device_key,
        "deviceName": device.device_name,
        "data": data,
        "timestamp": now_epoch_ms(),
    })
}

impl DeviceDataHandler {
    pub fn new(
        config: IngestConfig,
        stores: IngestStores,
        queue: MessageQueue,
        live: Arc<dyn LivePush>,
        northbound: Arc<dyn NorthboundPush>,
    ) -> Self {
        Self {
            config,
            stores,
            queue,
            live,
            northbound,
            snapshots: Mutex::new(HashMap::new()),
            pending_shadows: Mutex::new(HashMap::new()),
            audit: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flusher: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// 与快照比较并合并；首次上报或任一字段变化返回 true。
    fn detect_change(&self, device_id: &str, data: &DataMap) -> bool {
        let mut snapshots = guard(&self.snapshots);
        match snapshots.get_mut(device_id) {
            None => {
                snapshots.insert(device_id.to_string(), data.clone());
                true
            }
            Some(cached) => {
                let changed = data.iter().any(|(key, value)| cached.get(key) != Some(value));
                for (key, value) in data {
                    cached.insert(key.clone(), value.clone());
                }
                changed
            }
        }
    }

    /// 最近一次属性快照。
    pub fn snapshot(&self, device_id: &str) -> Option<DataMap> {
        guard(&self.snapshots).get(device_id).cloned()
    }

    pub async fn handle_property_data(&self, device: &Device, data: DataMap) {
        let changed = self.detect_change(&device.id, &data);

        if !self
            .queue
            .send_device_data(DeviceDataMessage::new(&device.device_key, data.clone()))
        {
            warn!(target: "gw.ingest", device_key = %device.device_key, "device_data_enqueue_failed");
        }

        self.live
            .push(live_envelope("deviceData", device, Value::Object(data.clone())));

        if changed {
            if let Err(err) = self.northbound.push_data(device, &data).await {
                record_northbound_failure();
                warn!(target: "gw.ingest", device_key = %device.device_key, error = %err, "northbound_data_failed");
            }
        } else {
            debug!(target: "gw.ingest", device_key = %device.device_key, "property_unchanged");
        }

        self.spawn_time_series(device, &data);
        self.stage_shadow(device, data);
    }

    fn spawn_time_series(&self, device: &Device, data: &DataMap) {
        let store = Arc::clone(&self.stores.time_series);
        let point = TimeSeriesPoint {
            device_id: device.id.clone(),
            device_key: device.device_key.clone(),
            product_id: device.product_id.clone(),
            measurement: MEASUREMENT.to_string(),
            fields: data.clone(),
            ts_ms: now_epoch_ms(),
        };
        tokio::spawn(async move {
            let device_key = point.device_key.clone();
            if let Err(err) = store.write_point(point).await {
                warn!(target: "gw.ingest", device_key = %device_key, error = %err, "time_series_write_failed");
            }
        });
    }

    fn stage_shadow(&self, device: &Device, data: DataMap) {
        let mut pending = guard(&self.pending_shadows);
        match pending.get_mut(&device.id) {
            Some(entry) => {
                for (key, value) in data {
                    entry.patch.insert(key, value);
                }
            }
            None => {
                pending.insert(
                    device.id.clone(),
                    PendingShadow {
                        device: device.clone(),
                        patch: data,
                    },
                );
            }
        }
    }

    pub async fn handle_event_data(&self, device: &Device, data: DataMap) {
        let event_type = data
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let event_data = data.get("data").cloned().unwrap_or(Value::Null);

        if event_type.eq_ignore_ascii_case("alarm") {
            let mut alarm = DataMap::new();
            alarm.insert("deviceId".to_string(), json!(device.id));
            alarm.insert("deviceKey".to_string(), json!(device.device_key));
            alarm.insert("deviceName".to_string(), json!(device.device_name));
            alarm.insert("eventData".to_string(), event_data.clone());
            alarm.insert("timestamp".to_string(), json!(now_epoch_ms()));
            if !self
                .queue
                .send_alarm(AlarmMessage::new("alarm", alarm, EVENT_ALARM_PRIORITY))
            {
                warn!(target: "gw.ingest", device_key = %device.device_key, "alarm_enqueue_failed");
            }
        }

        self.append_audit(DeviceDataRecord {
            device_id: device.id.clone(),
            data_type: DeviceDataType::Event,
            key: Some(event_type.clone()),
            value: event_data.to_string(),
            ts_ms: now_epoch_ms(),
        })
        .await;

        self.live.push(live_envelope(
            "deviceEvent",
            device,
            json!({"eventType": event_type, "eventData": event_data}),
        ));

        if let Err(err) = self.northbound.push_event(device, &data).await {
            record_northbound_failure();
            warn!(target: "gw.ingest", device_key = %device.device_key, error = %err, "northbound_event_failed");
        }
    }

    pub async fn handle_command_response(&self, device: &Device, data: DataMap) {
        let command_id = data
            .get("commandId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let body = Value::Object(data.clone());
        self.append_audit(DeviceDataRecord {
            device_id: device.id.clone(),
            data_type: DeviceDataType::CommandResponse,
            key: command_id.clone(),
            value: body.to_string(),
            ts_ms: now_epoch_ms(),
        })
        .await;

        self.live.push(live_envelope(
            "commandResponse",
            device,
            json!({
                "commandId": command_id,
                "result": data.get("result").cloned().unwrap_or(Value::Null),
                "message": data.get("message").cloned().unwrap_or(Value::Null),
                "params": data.get("params").cloned().unwrap_or(Value::Null),
            }),
        ));
    }

    /// 状态变化扇出；OFFLINE 额外产生离线告警。
    pub async fn push_device_status(&self, device: &Device, status: DeviceStatus) {
        if status == DeviceStatus::Offline {
            let mut alarm = DataMap::new();
            alarm.insert("deviceId".to_string(), json!(device.id));
            alarm.insert("deviceKey".to_string(), json!(device.device_key));
            alarm.insert("deviceName".to_string(), json!(device.device_name));
            alarm.insert("ipAddress".to_string(), json!(device.ip_address));
            alarm.insert("message".to_string(), json!("设备离线"));
            alarm.insert("timestamp".to_string(), json!(now_epoch_ms()));
            if !self.queue.send_alarm(AlarmMessage::new(
                OFFLINE_ALARM_TYPE,
                alarm,
                OFFLINE_ALARM_PRIORITY,
            )) {
                warn!(target: "gw.ingest", device_key = %device.device_key, "offline_alarm_enqueue_failed");
            }
        }

        if let Err(err) = self.northbound.push_status(device, status).await {
            record_northbound_failure();
            warn!(target: "gw.ingest", device_key = %device.device_key, error = %err, "northbound_status_failed");
        }

        self.live.push(live_envelope(
            "deviceStatus",
            device,
            json!({"status": status.as_str()}),
        ));
        info!(target: "gw.ingest", device_key = %device.device_key, status = %status, "device_status_pushed");
    }

    /// 审计行入缓冲；缓冲满时先刷新再重试一次。
    async fn append_audit(&self, record: DeviceDataRecord) {
        let record = match self.try_append(record) {
            None => return,
            Some(record) => record,
        };
        self.flush().await;
        if let Some(record) = self.try_append(record) {
            warn!(target: "gw.ingest", device_id = %record.device_id, "audit_buffer_full_dropped");
        }
    }

    fn try_append(&self, record: DeviceDataRecord) -> Option<DeviceDataRecord> {
        let mut audit = guard(&self.audit);
        if audit.len() >= self.config.audit_capacity.max(1) {
            return Some(record);
        }
        audit.push_back(record);
        None
    }

    pub fn pending_audit_rows(&self) -> usize {
        guard(&self.audit).len()
    }

    /// 写出一批审计行并合并全部暂存影子。
    pub async fn flush(&self) {
        let _flushing = self.flush_lock.lock().await;
        self.flush_audit().await;
        self.flush_shadows().await;
    }

    async fn flush_audit(&self) {
        let batch: Vec<DeviceDataRecord> = {
            let mut audit = guard(&self.audit);
            let take = audit.len().min(self.config.audit_batch.max(1));
            audit.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        let rows = batch.len();
        match self.stores.device_data.save_batch(batch).await {
            Ok(()) => {
                record_audit_rows_flushed(rows as u64);
                debug!(target: "gw.ingest", rows, "audit_rows_flushed");
            }
            Err(err) => {
                warn!(target: "gw.ingest", rows, error = %err, "audit_flush_failed");
            }
        }
    }

    async fn flush_shadows(&self) {
        let pending: Vec<PendingShadow> = guard(&self.pending_shadows)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if pending.is_empty() {
            return;
        }

        let now = now_epoch_ms();
        let mut merged = Vec::with_capacity(pending.len());
        for entry in pending {
            let shadow = match self.stores.shadows.find_shadow(&entry.device.id).await {
                Ok(Some(mut shadow)) => {
                    shadow.merge_reported(&entry.patch, now);
                    shadow
                }
                Ok(None) => DeviceShadow::new(&entry.device.id, entry.patch, now),
                Err(err) => {
                    warn!(target: "gw.ingest", device_id = %entry.device.id, error = %err, "shadow_load_failed");
                    continue;
                }
            };
            merged.push((entry.device, shadow));
        }

        let shadows: Vec<DeviceShadow> = merged.iter().map(|(_, shadow)| shadow.clone()).collect();
        let count = shadows.len();
        if let Err(err) = self.stores.shadows.save_batch(shadows).await {
            warn!(target: "gw.ingest", count, error = %err, "shadow_flush_failed");
            return;
        }
        record_shadow_flush();
        debug!(target: "gw.ingest", count, "shadows_flushed");

        for (device, shadow) in merged {
            self.live.push(live_envelope(
                "deviceShadow",
                &device,
                json!({
                    "reported": shadow.reported,
                    "desired": shadow.desired,
                    "version": shadow.version,
                }),
            ));
        }
    }

    /// 启动周期刷新任务；重复调用无效果。
    pub fn start(self: &Arc<Self>) {
        let mut flusher = guard(&self.flusher);
        if flusher.is_some() {
            return;
        }
        let handler = Arc::clone(self);
        let period = self.config.flush_interval.max(Duration::from_millis(10));
        *flusher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handler.flush().await;
            }
        }));
        info!(target: "gw.ingest", period_ms = period.as_millis() as u64, "ingest_flusher_started");
    }

    /// 停止刷新任务并把剩余数据写出。
    pub async fn shutdown(&self) {
        let handle = guard(&self.flusher).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        // 每次最多写出一批审计行，直到缓冲清空或不再减少
        loop {
            let before = self.pending_audit_rows();
            self.flush().await;
            let after = self.pending_audit_rows();
            if after == 0 || after >= before {
                break;
            }
        }
        info!(target: "gw.ingest", "ingest_flusher_stopped");
    }
}

impl std::fmt::Debug for DeviceDataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDataHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// 设备负载必须是 JSON 对象。
pub(crate) fn payload_object(payload: &[u8]) -> Result<DataMap, IngestError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(IngestError::InvalidPayload(format!(
            "expected JSON object, got {}",
            type_name(&other)
        ))),
        Err(err) => Err(IngestError::InvalidPayload(err.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_must_be_an_object() {
        assert!(payload_object(br#"{"temp": 1}"#).is_ok());
        assert!(matches!(
            payload_object(b"[1, 2]"),
            Err(IngestError::InvalidPayload(message)) if message.contains("array")
        ));
        assert!(payload_object(b"not json").is_err());
    }

    #[test]
    fn envelope_wraps_device_identity() {
        let mut device = Device::new("d-1", "meter-01", "p-1");
        device.device_name = "电表".to_string();
        let body = live_envelope("deviceData", &device, json!({"v": 1}));
        assert_eq!(body["type"], "deviceData");
        assert_eq!(body["deviceName"], "电表");
        assert_eq!(body["data"]["v"], 1);
    }
}
