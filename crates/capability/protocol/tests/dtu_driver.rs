use async_trait::async_trait;
use domain::{DataMap, Device, DriverConfig};
use gw_driver::{DeviceDriver, DeviceMessageSink, DriverContext};
use gw_protocol::drivers::DtuGatewayDriver;
use gw_storage::{InMemoryDeviceStore, InMemoryMappingStore};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Default)]
struct Reports {
    online: Mutex<Vec<String>>,
    offline: Mutex<Vec<String>>,
    properties: Mutex<Vec<(String, DataMap)>>,
}

impl Reports {
    fn properties(&self) -> Vec<(String, DataMap)> {
        self.properties.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn offline(&self) -> Vec<String> {
        self.offline.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeviceMessageSink for Reports {
    async fn authenticate(&self, _client_id: &str, _username: &str, _password: &str) -> bool {
        false
    }

    async fn device_online(&self, device_key: &str, _ip_address: Option<&str>) {
        if let Ok(mut online) = self.online.lock() {
            online.push(device_key.to_string());
        }
    }

    async fn device_offline(&self, device_key: &str) {
        if let Ok(mut offline) = self.offline.lock() {
            offline.push(device_key.to_string());
        }
    }

    async fn handle_device_message(&self, _topic: &str, _payload: &[u8]) {}

    async fn report_property(&self, device: &Device, data: DataMap) {
        if let Ok(mut properties) = self.properties.lock() {
            properties.push((device.device_key.clone(), data));
        }
    }

    async fn report_event(&self, _device: &Device, _data: DataMap) {}
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn driver(reports: Arc<Reports>) -> DtuGatewayDriver {
    let mut device = Device::new("d-1", "dtu-001", "pk-1");
    device.driver_id = Some("drv-dtu".to_string());
    let context = DriverContext::new(
        Arc::new(InMemoryDeviceStore::with_devices(vec![device])),
        Arc::new(InMemoryMappingStore::new()),
        reports,
    );
    let config = json!({"port": 0});
    DtuGatewayDriver::new(
        DriverConfig::new(
            "drv-dtu",
            "dtu",
            "DTU_GATEWAY",
            config.as_object().cloned().unwrap_or_default(),
        ),
        context,
    )
}

#[tokio::test]
async fn registered_dtu_reports_and_receives_commands() {
    let reports = Arc::new(Reports::default());
    let driver = driver(reports.clone());
    driver.start().await.expect("start");
    let port = driver.local_addr().await.expect("listening").port();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"REG:dtu-001\n").await.expect("register");
    writer.write_all(b"{\"temp\":21.5}\n").await.expect("report");

    eventually(|| !reports.properties().is_empty()).await;
    let (key, data) = reports.properties().remove(0);
    assert_eq!(key, "dtu-001");
    assert_eq!(data.get("temp"), Some(&json!(21.5)));
    assert!(driver.is_device_online("dtu-001").await);
    assert_eq!(driver.registered_devices().await, vec!["dtu-001".to_string()]);

    let mut command = DataMap::new();
    command.insert("switch".to_string(), json!(1));
    assert!(driver.write_data("dtu-001", &command).await.expect("write"));
    let mut lines = BufReader::new(reader).lines();
    let line = lines.next_line().await.expect("read").expect("line");
    assert_eq!(line, r#"{"switch":1}"#);

    drop(writer);
    drop(lines);
    eventually(|| reports.offline().contains(&"dtu-001".to_string())).await;
    assert!(!driver.is_device_online("dtu-001").await);
    driver.stop().await.expect("stop");
}

#[tokio::test]
async fn unknown_device_registration_is_dropped() {
    let reports = Arc::new(Reports::default());
    let driver = driver(reports.clone());
    driver.start().await.expect("start");
    let port = driver.local_addr().await.expect("listening").port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    stream.write_all(b"REG:ghost\n").await.expect("register");
    let mut buf = Vec::new();
    let mut reader = BufReader::new(&mut stream);
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_until(b'\n', &mut buf))
        .await
        .expect("closed in time")
        .expect("read");
    assert_eq!(read, 0);
    assert!(driver.registered_devices().await.is_empty());
    assert!(!driver.write_data("ghost", &DataMap::new()).await.expect("write"));
    driver.stop().await.expect("stop");
}
