//! S7 定时采集：每个设备一个固定间隔任务。
//!
//! 连续失败达到阈值时 ONLINE → OFFLINE，下一次成功恢复 ONLINE。

use super::address::S7Address;
use super::client::{S7Client, S7Endpoint};
use super::data_util;
use crate::error::ProtocolError;
use domain::{DataMap, Device, DeviceStatus, PropertyMapping};
use gw_driver::DriverContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL_MS: u64 = 5000;

/// 状态切换结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Online,
    Offline,
}

/// 连续失败计数。
#[derive(Debug, Clone)]
pub struct FailureTracker {
    max_failures: u32,
    failures: u32,
}

impl FailureTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures: max_failures.max(1),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_success(&mut self, status: DeviceStatus) -> Transition {
        self.failures = 0;
        if status.should_activate() {
            Transition::Online
        } else {
            Transition::Unchanged
        }
    }

    pub fn on_failure(&mut self, status: DeviceStatus) -> Transition {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures && status == DeviceStatus::Online {
            Transition::Offline
        } else {
            Transition::Unchanged
        }
    }
}

/// 读取映射需要的字节数：位地址 1 字节，其余按数据类型。
fn read_size(address: &S7Address, mapping: &PropertyMapping) -> u16 {
    if address.bit.is_some() {
        1
    } else {
        mapping.data_type.byte_size()
    }
}

/// 读取设备全部映射；任一映射失败即整体失败。
pub async fn collect(
    client: &S7Client,
    device_id: &str,
    mappings: &[PropertyMapping],
) -> Result<DataMap, ProtocolError> {
    let mut data = DataMap::new();
    for mapping in mappings {
        let address: S7Address = mapping.address.parse()?;
        let size = read_size(&address, mapping);
        let buf = client.read_address(device_id, &address, size).await?;
        data.insert(
            mapping.identifier.clone(),
            data_util::decode_value(&buf, address.bit, mapping),
        );
    }
    Ok(data)
}

pub struct S7Poller {
    client: Arc<S7Client>,
    context: DriverContext,
    default_interval: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl S7Poller {
    pub fn new(client: Arc<S7Client>, context: DriverContext, default_interval: Duration) -> Self {
        Self {
            client,
            context,
            default_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<S7Client> {
        &self.client
    }

    /// 连接设备并启动采集任务；连接失败不阻止任务启动，由采集循环重试。
    pub async fn add_device(&self, device: Device) {
        let interval_ms = device
            .config_i64("interval")
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_interval);

        let worker = DeviceWorker {
            client: Arc::clone(&self.client),
            context: self.context.clone(),
            tracker: FailureTracker::new(self.context.tuning.s7_max_fail_count),
            device,
        };
        let device_id = worker.device.id.clone();
        info!(
            target: "gw.s7",
            device_key = %worker.device.device_key,
            interval_ms = interval_ms.as_millis() as u64,
            "s7_device_added"
        );
        let handle = tokio::spawn(worker.run(interval_ms));
        if let Some(previous) = self.tasks.lock().await.insert(device_id, handle) {
            previous.abort();
        }
    }

    pub async fn remove_device(&self, device_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(device_id) {
            handle.abort();
        }
        self.client.disconnect(device_id).await;
    }

    pub async fn device_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }
        self.client.close_all().await;
    }
}

struct DeviceWorker {
    client: Arc<S7Client>,
    context: DriverContext,
    tracker: FailureTracker,
    device: Device,
}

impl DeviceWorker {
    async fn run(mut self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh_device().await;
            match self.poll_once().await {
                Ok(data) => {
                    let transition = self.tracker.on_success(self.device.status);
                    if transition == Transition::Online {
                        self.context
                            .sink
                            .device_online(&self.device.device_key, self.device.config_str("host"))
                            .await;
                        self.device.status = DeviceStatus::Online;
                    }
                    if !data.is_empty() {
                        self.context.sink.report_property(&self.device, data).await;
                    }
                }
                Err(err) => {
                    let transition = self.tracker.on_failure(self.device.status);
                    warn!(
                        target: "gw.s7",
                        device_key = %self.device.device_key,
                        failures = self.tracker.failures(),
                        error = %err,
                        "s7_poll_failed"
                    );
                    if transition == Transition::Offline {
                        gw_telemetry::record_s7_offline_transition();
                        self.context.sink.device_offline(&self.device.device_key).await;
                        self.device.status = DeviceStatus::Offline;
                    }
                }
            }
        }
    }

    /// 以存储中的最新状态为准；查不到时沿用本地副本。
    async fn refresh_device(&mut self) {
        if let Ok(Some(latest)) = self.context.devices.find_by_id(&self.device.id).await {
            self.device = latest;
        }
    }

    async fn poll_once(&self) -> Result<DataMap, ProtocolError> {
        if !self.client.is_connected(&self.device.id).await {
            let endpoint = S7Endpoint::from_device(&self.device)?;
            self.client.connect(&self.device.id, &endpoint).await?;
        }
        let mappings = self
            .context
            .mappings
            .resolve(&self.device)
            .await
            .map_err(|err| ProtocolError::DataParse(err.to_string()))?;
        let data = collect(&self.client, &self.device.id, &mappings).await?;
        debug!(
            target: "gw.s7",
            device_key = %self.device.device_key,
            points = data.len(),
            "s7_poll_succeeded"
        );
        Ok(data)
    }
}
