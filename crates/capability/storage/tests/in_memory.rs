use domain::{Device, DeviceStatus, DriverConfig, DriverStatus, TopoEdge};
use gw_storage::{
    DeviceStore, DriverStore, InMemoryDeviceStore, InMemoryDriverStore, InMemoryTopoStore,
    TopoStore,
};

#[tokio::test]
async fn device_status_online_stamps_activation() {
    let mut device = Device::new("d-1", "meter-01", "meter");
    device.driver_id = Some("drv-1".to_string());
    let store = InMemoryDeviceStore::with_devices(vec![device]);

    let updated = store
        .update_status("d-1", DeviceStatus::Online, 1_000)
        .await
        .expect("update")
        .expect("device");
    assert_eq!(updated.status, DeviceStatus::Online);
    assert_eq!(updated.active_time_ms, Some(1_000));

    store
        .update_status("d-1", DeviceStatus::Offline, 2_000)
        .await
        .expect("update");
    let found = store
        .find_by_key("meter-01")
        .await
        .expect("query")
        .expect("device");
    assert_eq!(found.status, DeviceStatus::Offline);
    assert_eq!(found.last_online_time_ms, Some(1_000));

    let bound = store.list_by_driver("drv-1").await.expect("list");
    assert_eq!(bound.len(), 1);
    assert!(store.update_status("missing", DeviceStatus::Online, 0).await.expect("update").is_none());
}

#[tokio::test]
async fn topology_bind_and_unbind() {
    let store = InMemoryTopoStore::new();
    store
        .bind(TopoEdge {
            gateway_id: "gw-1".to_string(),
            sub_device_id: "sub-1".to_string(),
            bind_time_ms: 10,
        })
        .await
        .expect("bind");

    assert!(store.find_edge("gw-1", "sub-1").await.expect("find").is_some());
    assert!(store.find_edge("gw-2", "sub-1").await.expect("find").is_none());
    assert_eq!(store.list_sub_devices("gw-1").await.expect("list").len(), 1);
    assert!(store.unbind("gw-1", "sub-1").await.expect("unbind"));
    assert!(!store.unbind("gw-1", "sub-1").await.expect("unbind"));
}

#[tokio::test]
async fn driver_status_round_trip() {
    let store = InMemoryDriverStore::new();
    let config = DriverConfig::new("drv-1", "line", "TCP_DIRECT", Default::default());
    store.upsert(config, DriverStatus::Running).expect("upsert");

    let running = store.list_by_status(DriverStatus::Running).await.expect("list");
    assert_eq!(running.len(), 1);

    store
        .update_status("drv-1", DriverStatus::Stopped)
        .await
        .expect("update");
    assert_eq!(
        store.get_status("drv-1").await.expect("status"),
        Some(DriverStatus::Stopped)
    );
    assert!(store.update_status("drv-x", DriverStatus::Error).await.is_err());
}
