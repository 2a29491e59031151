//! 驱动契约与通用生命周期状态。

use crate::error::DriverError;
use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 设备驱动能力接口。
///
/// - `start`/`stop` 幂等：重复调用只记录告警
/// - 只收不发的协议 `read_data` 返回 `Unsupported`
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn config(&self) -> &DriverConfig;

    fn driver_id(&self) -> &str {
        &self.config().driver_id
    }

    fn driver_type(&self) -> &str {
        &self.config().driver_type
    }

    fn driver_name(&self) -> &str {
        &self.config().driver_name
    }

    async fn start(&self) -> Result<(), DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;

    fn is_running(&self) -> bool;

    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError>;

    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError>;

    async fn is_device_online(&self, device_key: &str) -> bool;

    fn config_fields(&self) -> Vec<DriverConfigField>;
}

/// 驱动公共状态：配置与运行标记。
///
/// 启停过程串行化，启动钩子成功后才置为运行中。
pub struct DriverBase {
    config: DriverConfig,
    running: AtomicBool,
    lifecycle: Mutex<()>,
}

impl DriverBase {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start_with<F, Fut>(&self, hook: F) -> Result<(), DriverError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DriverError>>,
    {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            warn!(
                target: "gw.driver",
                driver_id = %self.config.driver_id,
                driver_name = %self.config.driver_name,
                "driver_already_running"
            );
            return Ok(());
        }
        info!(
            target: "gw.driver",
            driver_id = %self.config.driver_id,
            driver_type = %self.config.driver_type,
            "driver_starting"
        );
        hook().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(target: "gw.driver", driver_id = %self.config.driver_id, "driver_started");
        Ok(())
    }

    pub async fn stop_with<F, Fut>(&self, hook: F) -> Result<(), DriverError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DriverError>>,
    {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            warn!(
                target: "gw.driver",
                driver_id = %self.config.driver_id,
                driver_name = %self.config.driver_name,
                "driver_not_running"
            );
            return Ok(());
        }
        hook().await?;
        self.running.store(false, Ordering::SeqCst);
        info!(target: "gw.driver", driver_id = %self.config.driver_id, "driver_stopped");
        Ok(())
    }

    /// 运行中才允许读写。
    pub fn ensure_running(&self) -> Result<(), DriverError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DriverError::NotRunning(self.config.driver_id.clone()))
        }
    }
}
