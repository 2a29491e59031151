//! Modbus TCP 主站：池化连接、批量读取与按映射解码、写入。

use super::decode::{self, ReadPlan};
use super::pool::{Acquired, ConnectionPool};
use super::write_plan::WriteOp;
use crate::error::ProtocolError;
use domain::{DataMap, Device};
use gw_driver::{DriverContext, DriverError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_SLAVE: u8 = 1;
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// 设备连接参数（来自设备级驱动配置）。
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub slave: u8,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn from_device(device: &Device, default_timeout: Duration) -> Result<Self, ProtocolError> {
        let host = device
            .config_str("host")
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                ProtocolError::ConfigParse(format!("device {} has no host", device.device_key))
            })?
            .to_string();
        let port = match device.config_i64("port") {
            Some(port) => u16::try_from(port)
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| ProtocolError::ConfigParse(format!("invalid port: {port}")))?,
            None => DEFAULT_PORT,
        };
        let slave = match device.config_i64("slaveAddress") {
            Some(slave) => u8::try_from(slave)
                .ok()
                .filter(|slave| (1..=247).contains(slave))
                .ok_or_else(|| {
                    ProtocolError::ConfigParse(format!("slave address out of range: {slave}"))
                })?,
            None => DEFAULT_SLAVE,
        };
        let timeout = device
            .config_i64("timeout")
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Ok(Self {
            host,
            port,
            slave,
            timeout,
        })
    }

    async fn socket_addr(&self) -> Result<SocketAddr, ProtocolError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| ProtocolError::Connection(format!("cannot resolve {}", self.host)))
    }
}

enum RawRead {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
}

pub struct ModbusMaster {
    pool: ConnectionPool<Context>,
    context: DriverContext,
    default_timeout: Duration,
}

impl ModbusMaster {
    pub fn new(context: DriverContext, default_timeout: Duration) -> Self {
        let pool = ConnectionPool::new(
            context.tuning.modbus_pool_max,
            context.tuning.modbus_pool_expire,
        );
        Self {
            pool,
            context,
            default_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<Context> {
        &self.pool
    }

    /// 获取设备连接；池满返回 `None`。
    ///
    /// 新建连接时若设备处于 INACTIVE/OFFLINE，通知上线。
    pub async fn get_or_connect(
        &self,
        device: &Device,
    ) -> Result<Option<Arc<Mutex<Context>>>, ProtocolError> {
        let endpoint = Endpoint::from_device(device, self.default_timeout)?;
        let acquired = self
            .pool
            .get_or_connect(&device.id, || connect(endpoint.clone()))
            .await?;
        match acquired {
            Acquired::Created(conn) => {
                info!(
                    target: "gw.modbus",
                    device_key = %device.device_key,
                    host = %endpoint.host,
                    port = endpoint.port,
                    slave = endpoint.slave,
                    "modbus_connected"
                );
                if device.status.should_activate() {
                    self.context
                        .sink
                        .device_online(&device.device_key, Some(endpoint.host.as_str()))
                        .await;
                }
                Ok(Some(conn))
            }
            Acquired::Reused(conn) => Ok(Some(conn)),
            Acquired::Refused => Ok(None),
        }
    }

    async fn require_connection(
        &self,
        device: &Device,
    ) -> Result<Arc<Mutex<Context>>, ProtocolError> {
        self.get_or_connect(device)
            .await?
            .ok_or(ProtocolError::PoolFull(self.context.tuning.modbus_pool_max))
    }

    fn timeout_for(&self, device: &Device) -> Duration {
        device
            .config_i64("timeout")
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// 按功能码批量读取并用设备映射解码。
    pub async fn read(
        &self,
        device: &Device,
        plan: ReadPlan,
        mappings: &[domain::PropertyMapping],
    ) -> Result<DataMap, ProtocolError> {
        if !decode::is_read_function(plan.function_code) {
            return Err(ProtocolError::ConfigParse(format!(
                "unsupported read function code: 0x{:02X}",
                plan.function_code
            )));
        }
        let conn = self.require_connection(device).await?;
        let limit = self.timeout_for(device);
        let outcome = {
            let mut ctx = conn.lock().await;
            match timeout(limit, read_raw(&mut ctx, plan)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout(format!(
                    "modbus read from {}",
                    device.device_key
                ))),
            }
        };
        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                self.pool.remove(&device.id).await;
                return Err(err);
            }
        };
        let data = match raw {
            RawRead::Registers(registers) => {
                debug!(
                    target: "gw.modbus",
                    device_key = %device.device_key,
                    start = plan.start,
                    count = registers.len(),
                    "registers_read"
                );
                decode::decode_registers(plan.function_code, plan.start, &registers, mappings)
            }
            RawRead::Bits(bits) => {
                decode::decode_bits(plan.function_code, plan.start, &bits, mappings)
            }
        };
        Ok(data)
    }

    /// 读取设备全部映射（按读取规划分块批量读取）。
    pub async fn poll(&self, device: &Device) -> Result<DataMap, DriverError> {
        let mappings = self.context.mappings.resolve(device).await?;
        let mut data = DataMap::new();
        for plan in decode::plan_reads(&mappings) {
            data.extend(self.read(device, plan, &mappings).await?);
        }
        Ok(data)
    }

    /// 依次执行写入操作，任一失败即返回。
    pub async fn write(&self, device: &Device, ops: &[WriteOp]) -> Result<(), ProtocolError> {
        let conn = self.require_connection(device).await?;
        let limit = self.timeout_for(device);
        let mut ctx = conn.lock().await;
        for op in ops {
            let result = match timeout(limit, write_raw(&mut ctx, op)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout(format!(
                    "modbus write to {}",
                    device.device_key
                ))),
            };
            if let Err(err) = result {
                drop(ctx);
                self.pool.remove(&device.id).await;
                warn!(
                    target: "gw.modbus",
                    device_key = %device.device_key,
                    function_code = op.function_code(),
                    error = %err,
                    "modbus_write_failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self, device_id: &str) -> bool {
        self.pool.remove(device_id).await
    }

    pub async fn sweep(&self) -> usize {
        self.pool.sweep_expired().await
    }

    pub async fn close_all(&self) {
        self.pool.clear().await;
    }
}

async fn connect(endpoint: Endpoint) -> Result<Context, ProtocolError> {
    let addr = endpoint.socket_addr().await?;
    match timeout(endpoint.timeout, tcp::connect_slave(addr, Slave(endpoint.slave))).await {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(err)) => Err(ProtocolError::Connection(format!("{addr}: {err}"))),
        Err(_) => Err(ProtocolError::Timeout(format!("connect {addr}"))),
    }
}

async fn read_raw(ctx: &mut Context, plan: ReadPlan) -> Result<RawRead, ProtocolError> {
    let ReadPlan {
        function_code,
        start,
        quantity,
    } = plan;
    let raw = match function_code {
        decode::READ_COILS => RawRead::Bits(
            ctx.read_coils(start, quantity)
                .await
                .map_err(|e| ProtocolError::Modbus(e.to_string()))?
                .map_err(|e| ProtocolError::Modbus(format!("exception: {e:?}")))?,
        ),
        decode::READ_DISCRETE_INPUTS => RawRead::Bits(
            ctx.read_discrete_inputs(start, quantity)
                .await
                .map_err(|e| ProtocolError::Modbus(e.to_string()))?
                .map_err(|e| ProtocolError::Modbus(format!("exception: {e:?}")))?,
        ),
        decode::READ_HOLDING_REGISTERS => RawRead::Registers(
            ctx.read_holding_registers(start, quantity)
                .await
                .map_err(|e| ProtocolError::Modbus(e.to_string()))?
                .map_err(|e| ProtocolError::Modbus(format!("exception: {e:?}")))?,
        ),
        decode::READ_INPUT_REGISTERS => RawRead::Registers(
            ctx.read_input_registers(start, quantity)
                .await
                .map_err(|e| ProtocolError::Modbus(e.to_string()))?
                .map_err(|e| ProtocolError::Modbus(format!("exception: {e:?}")))?,
        ),
        other => {
            return Err(ProtocolError::ConfigParse(format!(
                "unsupported read function code: 0x{other:02X}"
            )));
        }
    };
    Ok(raw)
}

async fn write_raw(ctx: &mut Context, op: &WriteOp) -> Result<(), ProtocolError> {
    match op {
        WriteOp::SingleCoil { address, value } => ctx.write_single_coil(*address, *value).await,
        WriteOp::MultipleCoils { start, values } => ctx.write_multiple_coils(*start, values).await,
        WriteOp::SingleRegister { address, value } => {
            ctx.write_single_register(*address, *value).await
        }
        WriteOp::MultipleRegisters { start, values } => {
            ctx.write_multiple_registers(*start, values).await
        }
        WriteOp::MaskRegister {
            address,
            and_mask,
            or_mask,
        } => ctx.masked_write_register(*address, *and_mask, *or_mask).await,
    }
    .map_err(|e| ProtocolError::Modbus(e.to_string()))?
    .map_err(|e| ProtocolError::Modbus(format!("exception: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(config: serde_json::Value) -> Device {
        let mut device = Device::new("d-1", "meter-1", "prod-1");
        device.driver_config = config.as_object().cloned().unwrap_or_default();
        device
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = Endpoint::from_device(&device(json!({"host": "10.0.0.5"})), Duration::from_secs(3))
            .expect("endpoint");
        assert_eq!(endpoint.port, 502);
        assert_eq!(endpoint.slave, 1);
        assert_eq!(endpoint.timeout, Duration::from_secs(3));
    }

    #[test]
    fn endpoint_requires_host_and_valid_slave() {
        assert!(Endpoint::from_device(&device(json!({})), Duration::from_secs(3)).is_err());
        let err = Endpoint::from_device(
            &device(json!({"host": "plc", "slaveAddress": 248})),
            Duration::from_secs(3),
        )
        .expect_err("slave range");
        assert!(matches!(err, ProtocolError::ConfigParse(_)));
    }

    #[test]
    fn endpoint_reads_overrides() {
        let endpoint = Endpoint::from_device(
            &device(json!({"host": "plc", "port": "1502", "slaveAddress": 7, "timeout": 5})),
            Duration::from_secs(3),
        )
        .expect("endpoint");
        assert_eq!(endpoint.port, 1502);
        assert_eq!(endpoint.slave, 7);
        assert_eq!(endpoint.timeout, Duration::from_secs(5));
    }
}
