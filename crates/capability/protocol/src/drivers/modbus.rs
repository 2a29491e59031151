//! MODBUS_TCP 驱动：定时轮询绑定设备，按映射解码后上报。
//!
//! 调度规则：
//! - 每秒检查一次，设备到期（`pollingInterval` 秒）才发起轮询
//! - OFFLINE 设备每 6 个到期周期重试一次，成功后恢复正常节奏
//! - ONLINE 设备轮询失败立即通知离线
//! - 连接池按 `modbus_pool_sweep` 周期清理过期连接

use super::{TaskSet, active_devices};
use crate::modbus::decode::{self, DEFAULT_FUNCTION_CODE, ReadPlan};
use crate::modbus::master::DEFAULT_TIMEOUT_SECS;
use crate::modbus::write_plan::{MASK_WRITE_REGISTER, WRITE_SINGLE_COIL, WRITE_SINGLE_REGISTER};
use crate::modbus::{ModbusMaster, WriteOp, plan_writes};
use async_trait::async_trait;
use domain::{
    DataMap, DataType, Device, DeviceStatus, DriverConfig, DriverConfigField, FieldLevel,
    FieldType, PropertyMapping,
};
use gw_driver::{
    DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "MODBUS_TCP";
pub const DEFAULT_POLLING_SECS: u64 = 5;
/// OFFLINE 设备的重试间隔（以到期周期计）
pub const OFFLINE_RETRY_CYCLES: u32 = 6;
const SCHEDULER_TICK: Duration = Duration::from_secs(1);
const DEFAULT_READ_QUANTITY: u16 = 10;

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "Modbus TCP驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(ModbusTcpDriver::new(config, context)))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("pollingInterval", "轮询间隔(秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_POLLING_SECS))
            .range(1, 60)
            .tip("设备未单独配置时使用"),
        DriverConfigField::new("timeout", "超时时间(秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_TIMEOUT_SECS))
            .range(1, 10),
        DriverConfigField::new("host", "设备IP", FieldType::Text, FieldLevel::Device).required(),
        DriverConfigField::new("port", "端口", FieldType::Number, FieldLevel::Device)
            .default_value(json!(502))
            .range(1, 65535),
        DriverConfigField::new("slaveAddress", "从站地址", FieldType::Number, FieldLevel::Device)
            .default_value(json!(1))
            .range(1, 247),
        DriverConfigField::new("pollingInterval", "轮询间隔(秒)", FieldType::Number, FieldLevel::Device)
            .range(1, 60),
        DriverConfigField::new("timeout", "超时时间(秒)", FieldType::Number, FieldLevel::Device)
            .range(1, 10),
    ]
}

pub struct ModbusTcpDriver {
    base: DriverBase,
    context: DriverContext,
    master: Arc<ModbusMaster>,
    polling_interval: Duration,
    tasks: TaskSet,
}

impl ModbusTcpDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Self {
        let timeout = Duration::from_secs(config.get_u64_or("timeout", DEFAULT_TIMEOUT_SECS));
        let polling_interval =
            Duration::from_secs(config.get_u64_or("pollingInterval", DEFAULT_POLLING_SECS).max(1));
        let master = Arc::new(ModbusMaster::new(context.clone(), timeout));
        Self {
            base: DriverBase::new(config),
            context,
            master,
            polling_interval,
            tasks: TaskSet::default(),
        }
    }

    pub fn master(&self) -> &Arc<ModbusMaster> {
        &self.master
    }

    async fn on_start(&self) -> Result<(), DriverError> {
        let scheduler = Scheduler {
            driver_id: self.base.config().driver_id.clone(),
            master: Arc::clone(&self.master),
            context: self.context.clone(),
            default_interval: self.polling_interval,
            entries: HashMap::new(),
        };
        self.tasks.push(tokio::spawn(scheduler.run()));

        let master = Arc::clone(&self.master);
        let period = self.context.tuning.modbus_pool_sweep;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = master.sweep().await;
                if removed > 0 {
                    info!(target: "gw.modbus", removed, "modbus_pool_swept");
                }
            }
        }));
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), DriverError> {
        self.tasks.abort_all();
        self.master.close_all().await;
        Ok(())
    }
}

/// 设备轮询节奏。
#[derive(Debug, Clone, Copy)]
struct PollEntry {
    next_due: Instant,
    /// OFFLINE 期间已跳过的到期周期
    skipped: u32,
}

/// 到期判断：OFFLINE 设备只在每第 N 个到期周期真正轮询。
fn should_poll(entry: &mut PollEntry, status: DeviceStatus, now: Instant, period: Duration) -> bool {
    if now < entry.next_due {
        return false;
    }
    entry.next_due = now + period;
    if status == DeviceStatus::Offline {
        entry.skipped += 1;
        if entry.skipped < OFFLINE_RETRY_CYCLES {
            return false;
        }
        entry.skipped = 0;
    }
    true
}

fn device_interval(device: &Device, default: Duration) -> Duration {
    device
        .config_i64("pollingInterval")
        .and_then(|secs| u64::try_from(secs).ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

struct Scheduler {
    driver_id: String,
    master: Arc<ModbusMaster>,
    context: DriverContext,
    default_interval: Duration,
    entries: HashMap<String, PollEntry>,
}

impl Scheduler {
    async fn run(mut self) {
        let mut ticker = interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    async fn cycle(&mut self) {
        let devices = active_devices(&self.context, &self.driver_id).await;
        let now = Instant::now();
        self.entries
            .retain(|id, _| devices.iter().any(|device| &device.id == id));

        let mut polls = JoinSet::new();
        for device in devices {
            let period = device_interval(&device, self.default_interval);
            let entry = self.entries.entry(device.id.clone()).or_insert(PollEntry {
                next_due: now,
                skipped: 0,
            });
            if !should_poll(entry, device.status, now, period) {
                continue;
            }
            let master = Arc::clone(&self.master);
            polls.spawn(async move {
                let result = master.poll(&device).await;
                (device, result)
            });
        }

        while let Some(joined) = polls.join_next().await {
            let (device, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(target: "gw.modbus", error = %err, "modbus_poll_task_failed");
                    continue;
                }
            };
            match result {
                Ok(data) => {
                    debug!(
                        target: "gw.modbus",
                        device_key = %device.device_key,
                        points = data.len(),
                        "modbus_poll_succeeded"
                    );
                    if !data.is_empty() {
                        self.context.sink.report_property(&device, data).await;
                    }
                }
                Err(err) => {
                    warn!(
                        target: "gw.modbus",
                        device_key = %device.device_key,
                        status = %device.status,
                        error = %err,
                        "modbus_poll_failed"
                    );
                    if device.status == DeviceStatus::Online {
                        self.context.sink.device_offline(&device.device_key).await;
                    }
                }
            }
        }
    }
}

fn param_u16(params: &DataMap, key: &str, default: u16) -> Result<u16, DriverError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
            .and_then(|number| u16::try_from(number).ok())
            .ok_or_else(|| DriverError::Config(format!("invalid {key}: {value}"))),
    }
}

fn param_u8(params: &DataMap, key: &str, default: u8) -> Result<u8, DriverError> {
    let value = param_u16(params, key, u16::from(default))?;
    u8::try_from(value).map_err(|_| DriverError::Config(format!("invalid {key}: {value}")))
}

/// 映射属性值还原为寄存器原始值：`(value - offset) / scale`。
fn raw_for_mapping(mapping: &PropertyMapping, value: &Value) -> Value {
    if mapping.data_type == DataType::Bool {
        return value.clone();
    }
    let Some(number) = value.as_f64() else {
        return value.clone();
    };
    let mut raw = number - mapping.offset.unwrap_or(0.0);
    if let Some(scale) = mapping.scale.filter(|scale| *scale != 0.0) {
        raw /= scale;
    }
    Value::from(raw.round() as i64)
}

/// 下发数据整理结果：按功能码分组的 (地址, 值) 与寄存器位写入。
#[derive(Debug, Default)]
struct CollectedWrites {
    groups: BTreeMap<u8, Vec<(u16, Value)>>,
    bit_writes: Vec<WriteOp>,
}

impl CollectedWrites {
    fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.bit_writes.is_empty()
    }
}

/// 整理下发数据。
///
/// 支持三种形式：
/// - `{"address": 10, "value": 1, "functionCode": 6}`
/// - `{"functionCode": 16, "writes": [{"address": 10, "value": 1}, ...]}`
/// - `{"<identifier>": value, ...}`：按设备映射找地址，bool 写线圈，带位号的 bool 掩码写寄存器位，其余写寄存器
fn collect_writes(data: &DataMap, mappings: &[PropertyMapping]) -> Result<CollectedWrites, DriverError> {
    let mut collected = CollectedWrites::default();

    if let Some(writes) = data.get("writes").and_then(Value::as_array) {
        let code = param_u8(data, "functionCode", WRITE_SINGLE_REGISTER)?;
        for item in writes {
            let entry = item
                .as_object()
                .ok_or_else(|| DriverError::Config("writes entries must be objects".to_string()))?;
            let address = param_u16(entry, "address", 0)?;
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            collected.groups.entry(code).or_default().push((address, value));
        }
        return Ok(collected);
    }

    if data.contains_key("address") {
        let code = param_u8(data, "functionCode", WRITE_SINGLE_REGISTER)?;
        let address = param_u16(data, "address", 0)?;
        let value = data.get("value").cloned().unwrap_or(Value::Null);
        collected.groups.entry(code).or_default().push((address, value));
        return Ok(collected);
    }

    for (identifier, value) in data {
        let Some(mapping) = mappings.iter().find(|m| &m.identifier == identifier) else {
            debug!(target: "gw.modbus", identifier = %identifier, "modbus_write_unmapped");
            continue;
        };
        let Some(address) = mapping.numeric_address() else {
            return Err(DriverError::Config(format!(
                "mapping {identifier} has no numeric address"
            )));
        };
        let bit_function = mapping
            .function_code_value()
            .is_some_and(decode::is_bit_function);
        if !bit_function && mapping.data_type == DataType::Bool {
            if let Some(bit) = mapping.bit_index {
                collected
                    .bit_writes
                    .push(WriteOp::register_bit(address, bit, value)?);
                continue;
            }
        }
        let code = if bit_function || mapping.data_type == DataType::Bool {
            WRITE_SINGLE_COIL
        } else {
            WRITE_SINGLE_REGISTER
        };
        collected
            .groups
            .entry(code)
            .or_default()
            .push((address, raw_for_mapping(mapping, value)));
    }
    Ok(collected)
}

#[async_trait]
impl DeviceDriver for ModbusTcpDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.base.start_with(|| self.on_start()).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.base.stop_with(|| self.on_stop()).await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    /// 参数：`functionCode`（默认 3）、`startAddress`（默认 0）、`quantity`（默认 10）。
    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let plan = ReadPlan {
            function_code: param_u8(params, "functionCode", DEFAULT_FUNCTION_CODE)?,
            start: param_u16(params, "startAddress", 0)?,
            quantity: param_u16(params, "quantity", DEFAULT_READ_QUANTITY)?,
        };
        let mappings = self.context.mappings.resolve(&device).await?;
        Ok(self.master.read(&device, plan, &mappings).await?)
    }

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let mappings = self.context.mappings.resolve(&device).await?;
        let writes = collect_writes(data, &mappings)?;
        if writes.is_empty() {
            warn!(target: "gw.modbus", device_key, "modbus_write_empty");
            return Ok(false);
        }
        for (code, entries) in writes.groups {
            let ops = plan_writes(code, &entries)?;
            self.master.write(&device, &ops).await?;
            info!(
                target: "gw.modbus",
                device_key,
                function_code = code,
                points = entries.len(),
                requests = ops.len(),
                "modbus_write_succeeded"
            );
        }
        if !writes.bit_writes.is_empty() {
            self.master.write(&device, &writes.bit_writes).await?;
            info!(
                target: "gw.modbus",
                device_key,
                function_code = MASK_WRITE_REGISTER,
                points = writes.bit_writes.len(),
                "modbus_bit_write_succeeded"
            );
        }
        Ok(true)
    }

    async fn is_device_online(&self, device_key: &str) -> bool {
        matches!(
            self.context.devices.find_by_key(device_key).await,
            Ok(Some(device)) if device.status == DeviceStatus::Online
        )
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::write_plan::WRITE_MULTIPLE_REGISTERS;

    #[test]
    fn offline_devices_retry_every_sixth_cycle() {
        let start = Instant::now();
        let period = Duration::from_secs(1);
        let mut entry = PollEntry {
            next_due: start,
            skipped: 0,
        };
        let mut polled = Vec::new();
        for cycle in 0..12u64 {
            let now = start + Duration::from_secs(cycle);
            polled.push(should_poll(&mut entry, DeviceStatus::Offline, now, period));
        }
        let attempts: Vec<usize> = polled
            .iter()
            .enumerate()
            .filter(|(_, polled)| **polled)
            .map(|(cycle, _)| cycle)
            .collect();
        assert_eq!(attempts, vec![5, 11]);
    }

    #[test]
    fn online_devices_poll_when_due() {
        let start = Instant::now();
        let period = Duration::from_secs(5);
        let mut entry = PollEntry {
            next_due: start,
            skipped: 0,
        };
        assert!(should_poll(&mut entry, DeviceStatus::Online, start, period));
        assert!(!should_poll(
            &mut entry,
            DeviceStatus::Online,
            start + Duration::from_secs(4),
            period
        ));
        assert!(should_poll(
            &mut entry,
            DeviceStatus::Online,
            start + Duration::from_secs(5),
            period
        ));
    }

    #[test]
    fn explicit_writes_keep_function_code() {
        let data = json!({
            "functionCode": 16,
            "writes": [{"address": 10, "value": 1}, {"address": 11, "value": 2}]
        });
        let writes = collect_writes(data.as_object().expect("object"), &[]).expect("writes");
        let entries = writes.groups.get(&WRITE_MULTIPLE_REGISTERS).expect("group");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (10, json!(1)));
    }

    #[test]
    fn identifier_writes_reverse_scaling() {
        let mappings = vec![
            PropertyMapping::new("temperature", "100", DataType::Int).with_scale(0.1, 0.0),
            PropertyMapping::new("pump", "5", DataType::Bool).with_function_code("1"),
        ];
        let data = json!({"temperature": 25.0, "pump": true, "unknown": 1});
        let writes = collect_writes(data.as_object().expect("object"), &mappings).expect("writes");
        assert_eq!(
            writes.groups.get(&WRITE_SINGLE_REGISTER),
            Some(&vec![(100, json!(250))])
        );
        assert_eq!(writes.groups.get(&WRITE_SINGLE_COIL), Some(&vec![(5, json!(true))]));
        assert!(writes.bit_writes.is_empty());
    }

    #[test]
    fn bool_with_bit_index_writes_only_that_bit() {
        let mappings = vec![
            PropertyMapping::new("door", "40", DataType::Bool).with_bit(3),
            PropertyMapping::new("alarm", "40", DataType::Bool).with_bit(0),
        ];
        let data = json!({"door": true, "alarm": false});
        let writes = collect_writes(data.as_object().expect("object"), &mappings).expect("writes");
        assert!(writes.groups.is_empty());
        assert_eq!(writes.bit_writes.len(), 2);
        assert!(writes.bit_writes.contains(&WriteOp::MaskRegister {
            address: 40,
            and_mask: !0b1000,
            or_mask: 0b1000,
        }));
        assert!(writes.bit_writes.contains(&WriteOp::MaskRegister {
            address: 40,
            and_mask: !0b1,
            or_mask: 0,
        }));
    }

    #[test]
    fn single_address_write_defaults_to_register() {
        let data = json!({"address": "7", "value": 42});
        let writes = collect_writes(data.as_object().expect("object"), &[]).expect("writes");
        assert_eq!(writes.groups.get(&WRITE_SINGLE_REGISTER), Some(&vec![(7, json!(42))]));
    }
}
