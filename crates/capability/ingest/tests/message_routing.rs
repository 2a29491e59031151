use async_trait::async_trait;
use domain::{DataMap, Device, DeviceStatus, TopoEdge};
use gw_driver::{DeviceDownlink, DeviceMessageSink};
use gw_ingest::{
    AlarmConsumer, CommandConsumer, DeviceDataConsumer, DeviceDataHandler, DeviceMessageService,
    GatewayTopologyRouter, IngestConfig, IngestError, IngestStores, NoopLivePush, NorthboundPush,
};
use gw_pipeline::{AlarmMessage, CommandMessage, DeviceDataMessage, MessageHandler, MessageQueue};
use gw_storage::{
    DeviceStore, InMemoryDeviceDataStore, InMemoryDeviceStore, InMemoryShadowStore,
    InMemoryTimeSeriesStore, InMemoryTopoStore, TopoStore,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingDownlink {
    sent: Mutex<Vec<(String, String, Value)>>,
    offline: bool,
}

impl RecordingDownlink {
    fn sent(&self) -> Vec<(String, String, Value)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeviceDownlink for RecordingDownlink {
    async fn send_to_device(&self, device_key: &str, topic: &str, payload: &[u8]) -> bool {
        if self.offline {
            return false;
        }
        let body = serde_json::from_slice(payload).unwrap_or(Value::Null);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((device_key.to_string(), topic.to_string(), body));
        }
        true
    }

    fn is_connected(&self, _device_key: &str) -> bool {
        !self.offline
    }

    async fn disconnect(&self, _device_key: &str) {}
}

#[derive(Default)]
struct CountingNorthbound {
    pushes: AtomicUsize,
}

impl CountingNorthbound {
    fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NorthboundPush for CountingNorthbound {
    async fn push_data(&self, _device: &Device, _data: &DataMap) -> Result<(), IngestError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_event(&self, _device: &Device, _data: &DataMap) -> Result<(), IngestError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_status(&self, _device: &Device, _status: DeviceStatus) -> Result<(), IngestError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn device(id: &str, key: &str, secret: &str) -> Device {
    let mut device = Device::new(id, key, "pk-demo");
    device.device_name = format!("{key}-name");
    device.device_secret = secret.to_string();
    device
}

fn map(value: Value) -> DataMap {
    value.as_object().cloned().unwrap_or_default()
}

struct Fixture {
    service: DeviceMessageService,
    devices: Arc<InMemoryDeviceStore>,
    topology: Arc<InMemoryTopoStore>,
    downlink: Arc<RecordingDownlink>,
    queue: MessageQueue,
    northbound: Arc<CountingNorthbound>,
}

async fn fixture() -> Fixture {
    let mut disabled = device("d-4", "disabled-01", "s4");
    disabled.status = DeviceStatus::Disable;
    let devices = Arc::new(InMemoryDeviceStore::with_devices(vec![
        device("d-1", "gw-01", "s1"),
        device("d-2", "sensor-01", "s2"),
        device("d-3", "sensor-02", "s3"),
        disabled,
    ]));
    let topology = Arc::new(InMemoryTopoStore::new());
    topology
        .bind(TopoEdge {
            gateway_id: "d-1".to_string(),
            sub_device_id: "d-2".to_string(),
            bind_time_ms: 1,
        })
        .await
        .expect("bind");
    let downlink = Arc::new(RecordingDownlink::default());
    let queue = MessageQueue::default();
    let northbound = Arc::new(CountingNorthbound::default());
    let handler = Arc::new(DeviceDataHandler::new(
        IngestConfig::default(),
        IngestStores {
            shadows: Arc::new(InMemoryShadowStore::new()),
            device_data: Arc::new(InMemoryDeviceDataStore::new()),
            time_series: Arc::new(InMemoryTimeSeriesStore::new()),
        },
        queue.clone(),
        Arc::new(NoopLivePush),
        northbound.clone(),
    ));
    let router = GatewayTopologyRouter::new(devices.clone(), topology.clone(), downlink.clone());
    let service = DeviceMessageService::new(devices.clone(), handler, router, downlink.clone());
    Fixture {
        service,
        devices,
        topology,
        downlink,
        queue,
        northbound,
    }
}

#[tokio::test]
async fn authenticate_checks_secret_and_disabled_status() {
    let f = fixture().await;
    assert!(f.service.authenticate("sensor-01", "any", "s2").await);
    assert!(!f.service.authenticate("sensor-01", "any", "wrong").await);
    assert!(!f.service.authenticate("disabled-01", "any", "s4").await);
    assert!(!f.service.authenticate("ghost", "any", "s2").await);
}

#[tokio::test]
async fn online_and_offline_update_the_device_record() {
    let f = fixture().await;
    f.service.device_online("sensor-01", Some("192.168.1.20")).await;
    let stored = f.devices.find_by_key("sensor-01").await.expect("load").expect("device");
    assert_eq!(stored.status, DeviceStatus::Online);
    assert_eq!(stored.ip_address.as_deref(), Some("192.168.1.20"));
    assert!(stored.active_time_ms.is_some());

    f.service.device_offline("sensor-01").await;
    let stored = f.devices.find_by_key("sensor-01").await.expect("load").expect("device");
    assert_eq!(stored.status, DeviceStatus::Offline);
    // 离线告警入队
    assert_eq!(f.queue.queue_status().alarm, 1);
}

#[tokio::test]
async fn property_topic_is_dispatched_to_the_handler() {
    let f = fixture().await;
    f.service
        .handle_device_message("/pk-demo/sensor-01/property/post", br#"{"temp": 23}"#)
        .await;
    let snapshot = f.service.handler().snapshot("d-2").expect("snapshot");
    assert_eq!(snapshot.get("temp"), Some(&json!(23)));

    // 非对象负载、未知设备与格式错误的 Topic 都被丢弃
    f.service
        .handle_device_message("/pk-demo/sensor-02/property/post", b"[1,2]")
        .await;
    f.service
        .handle_device_message("/pk-demo/ghost/property/post", br#"{"temp": 1}"#)
        .await;
    f.service.handle_device_message("sensor-02/property", br#"{"temp": 1}"#).await;
    assert!(f.service.handler().snapshot("d-3").is_none());
    assert_eq!(f.queue.queue_status().device_data, 1);
}

#[tokio::test]
async fn gateway_data_for_bound_sub_device_is_routed() {
    let f = fixture().await;
    f.service
        .handle_device_message(
            "/pk-demo/gw-01/gateway/post",
            br#"{"subDeviceKey": "sensor-01", "data": {"hum": 61}}"#,
        )
        .await;
    let snapshot = f.service.handler().snapshot("d-2").expect("routed");
    assert_eq!(snapshot.get("hum"), Some(&json!(61)));
    assert!(f.service.handler().snapshot("d-1").is_none());

    let queued = f.queue.queue_status().device_data;
    let pushed = f.northbound.pushes();
    assert_eq!((queued, pushed), (1, 1));

    // 未绑定的子设备被拒绝，且没有任何副作用
    f.service
        .handle_device_message(
            "/pk-demo/gw-01/gateway/post",
            br#"{"subDeviceKey": "sensor-02", "data": {"hum": 10}}"#,
        )
        .await;
    assert!(f.service.handler().snapshot("d-3").is_none());
    assert!(f.service.handler().snapshot("d-1").is_none());
    assert_eq!(f.queue.queue_status().device_data, queued);
    assert_eq!(f.northbound.pushes(), pushed);

    // 无 subDeviceKey 时归属网关自身
    f.service
        .handle_device_message("/pk-demo/gw-01/gateway/post", br#"{"uptime": 99}"#)
        .await;
    let own = f.service.handler().snapshot("d-1").expect("gateway data");
    assert_eq!(own.get("uptime"), Some(&json!(99)));
}

#[tokio::test]
async fn topo_add_delete_and_get_are_acknowledged() {
    let f = fixture().await;
    let gateway = f.devices.find_by_key("gw-01").await.expect("load").expect("gateway");
    let router = GatewayTopologyRouter::new(
        f.devices.clone(),
        f.topology.clone(),
        f.downlink.clone(),
    );

    let added = router
        .handle_topo(&gateway, &map(json!({"action": "add", "subDeviceKey": "sensor-02"})))
        .await;
    assert_eq!(added.get("result"), Some(&json!("success")));
    assert!(f.topology.find_edge("d-1", "d-3").await.expect("edge").is_some());

    let listed = router.handle_topo(&gateway, &map(json!({"action": "get"}))).await;
    assert_eq!(listed.get("count"), Some(&json!(2)));
    let keys: Vec<&str> = listed["subDevices"]
        .as_array()
        .expect("list")
        .iter()
        .filter_map(|item| item["deviceKey"].as_str())
        .collect();
    assert!(keys.contains(&"sensor-01") && keys.contains(&"sensor-02"));

    let deleted = router
        .handle_topo(&gateway, &map(json!({"action": "delete", "subDeviceKey": "sensor-01"})))
        .await;
    assert_eq!(deleted.get("result"), Some(&json!("success")));
    assert!(f.topology.find_edge("d-1", "d-2").await.expect("edge").is_none());

    let unknown_device = router
        .handle_topo(&gateway, &map(json!({"action": "add", "subDeviceKey": "ghost"})))
        .await;
    assert_eq!(unknown_device.get("result"), Some(&json!("failed")));

    let unknown_action = router
        .handle_topo(&gateway, &map(json!({"action": "reset"})))
        .await;
    assert_eq!(unknown_action.get("result"), Some(&json!("failed")));

    let sent = f.downlink.sent();
    assert_eq!(sent.len(), 5);
    assert!(sent.iter().all(|(key, topic, _)| key == "gw-01" && topic == "/gw-01/topo/response"));
    assert_eq!(sent[0].2["action"], "add");
    assert_eq!(sent[0].2["subDeviceKey"], "sensor-02");
}

#[tokio::test]
async fn topo_topic_goes_through_the_service() {
    let f = fixture().await;
    f.service
        .handle_device_message(
            "/pk-demo/gw-01/topo/add",
            br#"{"action": "add", "subDeviceKey": "sensor-02"}"#,
        )
        .await;
    assert!(f.topology.find_edge("d-1", "d-3").await.expect("edge").is_some());
    assert_eq!(f.downlink.sent().len(), 1);
}

#[tokio::test]
async fn device_data_consumer_triggers_rules_by_device_id() {
    let f = fixture().await;
    let consumer = DeviceDataConsumer::new(f.devices.clone(), f.queue.clone());
    consumer
        .handle(DeviceDataMessage::new("sensor-01", map(json!({"temp": 1}))))
        .await
        .expect("handled");
    consumer
        .handle(DeviceDataMessage::new("ghost", map(json!({"temp": 1}))))
        .await
        .expect("unknown devices are skipped");
    assert_eq!(f.queue.queue_status().rule, 1);
}

#[tokio::test]
async fn offline_alarm_becomes_an_email_notification() {
    let f = fixture().await;
    let consumer = AlarmConsumer::new(f.queue.clone());
    let data = map(json!({"deviceName": "温度计", "ipAddress": "10.1.1.1", "deviceKey": "sensor-01"}));
    consumer
        .handle(AlarmMessage::new("DEVICE_OFFLINE", data, 5))
        .await
        .expect("handled");
    consumer
        .handle(AlarmMessage::new("alarm", DataMap::new(), 8))
        .await
        .expect("handled");
    assert_eq!(f.queue.queue_status().notification, 1);
}

#[tokio::test]
async fn command_consumer_publishes_to_command_topic() {
    let f = fixture().await;
    let consumer = CommandConsumer::new(f.devices.clone(), f.downlink.clone());
    consumer
        .handle(CommandMessage::new("sensor-01", map(json!({"switch": 1}))))
        .await
        .expect("sent");
    let sent = f.downlink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "/pk-demo/sensor-01/command/down");
    assert_eq!(sent[0].2["switch"], 1);

    assert!(
        consumer
            .handle(CommandMessage::new("ghost", DataMap::new()))
            .await
            .is_err()
    );

    let offline = CommandConsumer::new(
        f.devices.clone(),
        Arc::new(RecordingDownlink {
            offline: true,
            ..RecordingDownlink::default()
        }),
    );
    assert!(
        offline
            .handle(CommandMessage::new("sensor-01", DataMap::new()))
            .await
            .is_err()
    );
}
