use async_trait::async_trait;
use domain::{DataMap, DriverConfig, DriverConfigField, DriverLogType, DriverStatus};
use gw_driver::{
    DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError, DriverManager,
    DriverRegistry, NoopMessageSink,
};
use gw_storage::{
    DriverStore, InMemoryDeviceStore, InMemoryDriverLogStore, InMemoryDriverStore,
    InMemoryMappingStore,
};
use serde_json::json;
use std::sync::Arc;

struct FakeDriver {
    base: DriverBase,
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        let fail = self.base.config().get_bool("fail").unwrap_or(false);
        self.base
            .start_with(|| async move {
                if fail {
                    Err(DriverError::Transport("connect refused".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        if self.base.config().get_bool("stopFail").unwrap_or(false) {
            return Err(DriverError::Transport("close refused".to_string()));
        }
        self.base.stop_with(|| async { Ok(()) }).await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    async fn read_data(&self, _device_key: &str, _params: &DataMap) -> Result<DataMap, DriverError> {
        Err(DriverError::Unsupported("read".to_string()))
    }

    async fn write_data(&self, _device_key: &str, _data: &DataMap) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn is_device_online(&self, _device_key: &str) -> bool {
        false
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        Vec::new()
    }
}

fn fake_factory(
    config: DriverConfig,
    _context: DriverContext,
) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(FakeDriver {
        base: DriverBase::new(config),
    }))
}

struct Harness {
    manager: DriverManager,
    drivers: Arc<InMemoryDriverStore>,
    logs: Arc<InMemoryDriverLogStore>,
}

fn harness(auto_start: bool) -> Harness {
    let mut registry = DriverRegistry::new();
    registry.register(DriverDescriptor {
        driver_type: "FAKE",
        display_name: "fake",
        factory: fake_factory,
        fields: Vec::new,
    });
    let context = DriverContext::new(
        Arc::new(InMemoryDeviceStore::new()),
        Arc::new(InMemoryMappingStore::new()),
        Arc::new(NoopMessageSink),
    );
    let drivers = Arc::new(InMemoryDriverStore::new());
    let logs = Arc::new(InMemoryDriverLogStore::new());
    let manager = DriverManager::new(registry, context, drivers.clone(), logs.clone())
        .with_auto_start(auto_start);
    Harness {
        manager,
        drivers,
        logs,
    }
}

fn config(id: &str, driver_type: &str, fail: bool) -> DriverConfig {
    let mut map = DataMap::new();
    map.insert("fail".to_string(), json!(fail));
    DriverConfig::new(id, format!("driver {id}"), driver_type, map)
}

#[tokio::test]
async fn start_then_stop_records_status_and_audit() {
    let h = harness(true);
    h.drivers
        .upsert(config("drv-1", "FAKE", false), DriverStatus::Stopped)
        .expect("upsert");

    h.manager.start_driver("drv-1").await.expect("start");
    assert_eq!(h.manager.running_drivers().await, vec!["drv-1".to_string()]);
    assert_eq!(
        h.drivers.get_status("drv-1").await.expect("status"),
        Some(DriverStatus::Running)
    );

    let err = h.manager.start_driver("drv-1").await.expect_err("duplicate");
    assert!(matches!(err, DriverError::AlreadyRunning(_)));

    h.manager.stop_driver("drv-1").await.expect("stop");
    assert!(h.manager.get_driver("drv-1").await.is_none());
    assert_eq!(
        h.drivers.get_status("drv-1").await.expect("status"),
        Some(DriverStatus::Stopped)
    );

    let logs = h.logs.logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].log_type, DriverLogType::Start);
    assert_eq!(logs[1].log_type, DriverLogType::Stop);
    assert!(logs[1].ext.get("uptime").is_some());
    assert!(logs[1].ext.get("startTime").is_some());
}

#[tokio::test]
async fn failed_start_marks_error_without_keeping_instance() {
    let h = harness(true);
    h.drivers
        .upsert(config("drv-bad", "FAKE", true), DriverStatus::Stopped)
        .expect("upsert");

    let err = h.manager.start_driver("drv-bad").await.expect_err("fails");
    assert!(matches!(err, DriverError::Transport(_)));
    assert!(h.manager.get_driver("drv-bad").await.is_none());
    assert_eq!(
        h.drivers.get_status("drv-bad").await.expect("status"),
        Some(DriverStatus::Error)
    );
    assert_eq!(h.logs.logs()[0].log_type, DriverLogType::Error);
}

#[tokio::test]
async fn failed_stop_keeps_driver_registered_and_running() {
    let h = harness(true);
    let mut stubborn = config("drv-stuck", "FAKE", false);
    stubborn.config.insert("stopFail".to_string(), json!(true));
    h.drivers
        .upsert(stubborn, DriverStatus::Stopped)
        .expect("upsert");
    h.manager.start_driver("drv-stuck").await.expect("start");

    let err = h.manager.stop_driver("drv-stuck").await.expect_err("stop fails");
    assert!(matches!(err, DriverError::Transport(_)));
    let driver = h.manager.get_driver("drv-stuck").await.expect("still tracked");
    assert!(driver.is_running());
    assert!(h.manager.is_driver_running("drv-stuck").await);
    assert_eq!(
        h.drivers.get_status("drv-stuck").await.expect("status"),
        Some(DriverStatus::Running)
    );
    assert_eq!(h.logs.logs().last().map(|log| log.log_type), Some(DriverLogType::Error));

    h.manager
        .unregister_driver("drv-stuck")
        .await
        .expect_err("unregister fails too");
    assert!(h.manager.get_driver("drv-stuck").await.is_some());
}

#[tokio::test]
async fn unknown_driver_type_is_rejected() {
    let h = harness(true);
    h.drivers
        .upsert(config("drv-x", "TELEPATHY", false), DriverStatus::Stopped)
        .expect("upsert");
    let err = h.manager.start_driver("drv-x").await.expect_err("unknown");
    assert_eq!(err.to_string(), "unsupported driver type: TELEPATHY");
}

#[tokio::test]
async fn stop_of_idle_driver_is_an_error() {
    let h = harness(true);
    let err = h.manager.stop_driver("nope").await.expect_err("not running");
    assert!(matches!(err, DriverError::NotRunning(_)));
}

#[tokio::test]
async fn auto_load_starts_only_running_drivers() {
    let h = harness(true);
    h.drivers
        .upsert(config("drv-a", "FAKE", false), DriverStatus::Running)
        .expect("upsert");
    h.drivers
        .upsert(config("drv-b", "FAKE", false), DriverStatus::Stopped)
        .expect("upsert");
    h.drivers
        .upsert(config("drv-c", "FAKE", true), DriverStatus::Running)
        .expect("upsert");

    assert_eq!(h.manager.auto_load().await, 1);
    assert_eq!(h.manager.running_drivers().await, vec!["drv-a".to_string()]);
    assert_eq!(
        h.drivers.get_status("drv-c").await.expect("status"),
        Some(DriverStatus::Error)
    );
}

#[tokio::test]
async fn auto_load_can_be_disabled() {
    let h = harness(false);
    h.drivers
        .upsert(config("drv-a", "FAKE", false), DriverStatus::Running)
        .expect("upsert");
    assert_eq!(h.manager.auto_load().await, 0);
    assert!(h.manager.running_drivers().await.is_empty());
}

#[tokio::test]
async fn restart_and_stop_all() {
    let h = harness(true);
    h.drivers
        .upsert(config("drv-1", "FAKE", false), DriverStatus::Stopped)
        .expect("upsert");
    h.manager.restart_driver("drv-1").await.expect("restart from idle");
    h.manager.restart_driver("drv-1").await.expect("restart running");
    assert!(h.manager.is_driver_running("drv-1").await);
    assert!(h.manager.driver_uptime("drv-1").await >= 0);

    let driver = h.manager.get_driver("drv-1").await.expect("live");
    h.manager.stop_all().await;
    assert!(!driver.is_running());
    assert!(h.manager.running_drivers().await.is_empty());
}

#[tokio::test]
async fn register_overwrites_and_unregister_stops() {
    let h = harness(true);
    let first: Arc<dyn DeviceDriver> = Arc::new(FakeDriver {
        base: DriverBase::new(config("ext", "FAKE", false)),
    });
    first.start().await.expect("start");
    h.manager.register_driver("ext", first.clone()).await;

    let second: Arc<dyn DeviceDriver> = Arc::new(FakeDriver {
        base: DriverBase::new(config("ext", "FAKE", false)),
    });
    second.start().await.expect("start");
    h.manager.register_driver("ext", second.clone()).await;

    h.manager.unregister_driver("ext").await.expect("unregister");
    assert!(!second.is_running());
    assert!(first.is_running());
    assert!(h.manager.get_driver("ext").await.is_none());
}
