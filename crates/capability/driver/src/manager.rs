//! 驱动生命周期管理器。
//!
//! 唯一持有 driverId → 驱动实例映射；启停结果回写驱动状态并追加审计日志。
//! 审计与状态回写失败只记录日志，不影响启停结果。

use crate::context::DriverContext;
use crate::contract::DeviceDriver;
use crate::error::DriverError;
use crate::registry::DriverRegistry;
use domain::{DriverConfigField, DriverLogType, DriverStatus, now_epoch_ms};
use gw_storage::{DriverLogRecord, DriverLogStore, DriverStore};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

struct LiveDriver {
    driver: Arc<dyn DeviceDriver>,
    started_at_ms: i64,
}

pub struct DriverManager {
    registry: DriverRegistry,
    context: DriverContext,
    driver_store: Arc<dyn DriverStore>,
    log_store: Arc<dyn DriverLogStore>,
    auto_start: bool,
    live: Mutex<HashMap<String, LiveDriver>>,
}

impl DriverManager {
    pub fn new(
        registry: DriverRegistry,
        context: DriverContext,
        driver_store: Arc<dyn DriverStore>,
        log_store: Arc<dyn DriverLogStore>,
    ) -> Self {
        Self {
            registry,
            context,
            driver_store,
            log_store,
            auto_start: true,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// 启动时加载所有持久化状态为 RUNNING 的驱动，返回成功启动数。
    pub async fn auto_load(&self) -> usize {
        if !self.auto_start {
            info!(target: "gw.driver", "driver_auto_start_disabled");
            return 0;
        }
        let configs = match self.driver_store.list_by_status(DriverStatus::Running).await {
            Ok(configs) => configs,
            Err(err) => {
                error!(target: "gw.driver", error = %err, "driver_config_load_failed");
                return 0;
            }
        };
        let mut started = 0;
        for config in configs {
            match self.start_driver(&config.driver_id).await {
                Ok(()) => started += 1,
                Err(err) => {
                    error!(
                        target: "gw.driver",
                        driver_id = %config.driver_id,
                        error = %err,
                        "driver_auto_start_failed"
                    );
                }
            }
        }
        info!(target: "gw.driver", started, "driver_auto_load_finished");
        started
    }

    pub async fn start_driver(&self, driver_id: &str) -> Result<(), DriverError> {
        let config = self
            .driver_store
            .find_config(driver_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("driver {driver_id}")))?;

        // 持锁完成构造与启动，保证同一 driverId 只有一个实例
        let mut live = self.live.lock().await;
        if live.contains_key(driver_id) {
            warn!(target: "gw.driver", driver_id, "driver_already_running");
            return Err(DriverError::AlreadyRunning(driver_id.to_string()));
        }

        let started_at_ms = now_epoch_ms();
        let outcome = match self.registry.create(config, self.context.clone()) {
            Ok(driver) => {
                let started = driver.start().await;
                started.map(|()| driver)
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(driver) => {
                info!(
                    target: "gw.driver",
                    driver_id,
                    driver_type = %driver.driver_type(),
                    "driver_start_succeeded"
                );
                live.insert(
                    driver_id.to_string(),
                    LiveDriver {
                        driver,
                        started_at_ms,
                    },
                );
                drop(live);
                gw_telemetry::record_driver_start();
                self.persist_status(driver_id, DriverStatus::Running).await;
                self.append_log(
                    driver_id,
                    DriverLogType::Start,
                    "driver started".to_string(),
                    json!({ "uptime": 0, "startTime": started_at_ms }),
                )
                .await;
                Ok(())
            }
            Err(err) => {
                drop(live);
                gw_telemetry::record_driver_error();
                error!(target: "gw.driver", driver_id, error = %err, "driver_start_failed");
                self.persist_status(driver_id, DriverStatus::Error).await;
                self.append_log(
                    driver_id,
                    DriverLogType::Error,
                    format!("driver start failed: {err}"),
                    Value::Null,
                )
                .await;
                Err(err)
            }
        }
    }

    pub async fn stop_driver(&self, driver_id: &str) -> Result<(), DriverError> {
        let entry = self
            .live
            .lock()
            .await
            .remove(driver_id)
            .ok_or_else(|| DriverError::NotRunning(driver_id.to_string()))?;

        let uptime = now_epoch_ms().saturating_sub(entry.started_at_ms);
        if let Err(err) = entry.driver.stop().await {
            gw_telemetry::record_driver_error();
            error!(target: "gw.driver", driver_id, error = %err, "driver_stop_failed");
            self.append_log(
                driver_id,
                DriverLogType::Error,
                format!("driver stop failed: {err}"),
                Value::Null,
            )
            .await;
            // 停止失败的驱动仍在运行，放回运行表
            self.live
                .lock()
                .await
                .entry(driver_id.to_string())
                .or_insert(entry);
            return Err(err);
        }
        gw_telemetry::record_driver_stop();
        info!(target: "gw.driver", driver_id, uptime_ms = uptime, "driver_stop_succeeded");
        self.persist_status(driver_id, DriverStatus::Stopped).await;
        self.append_log(
            driver_id,
            DriverLogType::Stop,
            "driver stopped".to_string(),
            json!({ "uptime": uptime, "startTime": entry.started_at_ms }),
        )
        .await;
        Ok(())
    }

    /// 先停后启；两步之间不保证原子性。
    pub async fn restart_driver(&self, driver_id: &str) -> Result<(), DriverError> {
        if self.live.lock().await.contains_key(driver_id) {
            self.stop_driver(driver_id).await?;
        }
        self.start_driver(driver_id).await
    }

    /// 注册外部构造的驱动实例；同 ID 已存在则覆盖。
    pub async fn register_driver(&self, driver_id: &str, driver: Arc<dyn DeviceDriver>) {
        let mut live = self.live.lock().await;
        if live.contains_key(driver_id) {
            warn!(target: "gw.driver", driver_id, "driver_overwritten");
        }
        info!(target: "gw.driver", driver_id, driver_name = %driver.driver_name(), "driver_registered");
        live.insert(
            driver_id.to_string(),
            LiveDriver {
                driver,
                started_at_ms: now_epoch_ms(),
            },
        );
    }

    /// 卸载驱动；运行中则先停止。
    pub async fn unregister_driver(&self, driver_id: &str) -> Result<(), DriverError> {
        let entry = self.live.lock().await.remove(driver_id);
        if let Some(entry) = entry {
            if entry.driver.is_running() {
                if let Err(err) = entry.driver.stop().await {
                    error!(target: "gw.driver", driver_id, error = %err, "driver_stop_failed");
                    self.live
                        .lock()
                        .await
                        .entry(driver_id.to_string())
                        .or_insert(entry);
                    return Err(err);
                }
            }
            info!(target: "gw.driver", driver_id, "driver_unregistered");
        }
        Ok(())
    }

    pub async fn get_driver(&self, driver_id: &str) -> Option<Arc<dyn DeviceDriver>> {
        self.live
            .lock()
            .await
            .get(driver_id)
            .map(|entry| Arc::clone(&entry.driver))
    }

    pub async fn is_driver_running(&self, driver_id: &str) -> bool {
        self.live
            .lock()
            .await
            .get(driver_id)
            .is_some_and(|entry| entry.driver.is_running())
    }

    /// 运行中的驱动 ID（排序）。
    pub async fn running_drivers(&self) -> Vec<String> {
        let live = self.live.lock().await;
        let mut ids: Vec<String> = live
            .iter()
            .filter(|(_, entry)| entry.driver.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 运行时长（毫秒）；未运行返回 0。
    pub async fn driver_uptime(&self, driver_id: &str) -> i64 {
        self.live
            .lock()
            .await
            .get(driver_id)
            .map(|entry| now_epoch_ms().saturating_sub(entry.started_at_ms))
            .unwrap_or(0)
    }

    /// 停止全部驱动；单个失败只记录日志。
    pub async fn stop_all(&self) {
        let entries: Vec<(String, LiveDriver)> = self.live.lock().await.drain().collect();
        for (driver_id, entry) in entries {
            if !entry.driver.is_running() {
                continue;
            }
            if let Err(err) = entry.driver.stop().await {
                error!(target: "gw.driver", driver_id = %driver_id, error = %err, "driver_stop_failed");
            } else {
                gw_telemetry::record_driver_stop();
            }
        }
        info!(target: "gw.driver", "all_drivers_stopped");
    }

    pub fn driver_types(&self) -> Vec<&'static str> {
        self.registry.driver_types()
    }

    pub fn config_fields(&self, driver_type: &str) -> Result<Vec<DriverConfigField>, DriverError> {
        self.registry
            .config_fields(driver_type)
            .ok_or_else(|| DriverError::UnknownType(driver_type.to_string()))
    }

    async fn persist_status(&self, driver_id: &str, status: DriverStatus) {
        if let Err(err) = self.driver_store.update_status(driver_id, status).await {
            error!(target: "gw.driver", driver_id, error = %err, "driver_status_update_failed");
        }
    }

    async fn append_log(&self, driver_id: &str, log_type: DriverLogType, content: String, ext: Value) {
        let record = DriverLogRecord {
            driver_id: driver_id.to_string(),
            log_type,
            content,
            ext,
            ts_ms: now_epoch_ms(),
        };
        if let Err(err) = self.log_store.append(record).await {
            error!(target: "gw.driver", driver_id, error = %err, "driver_log_append_failed");
        }
    }
}
