//! 北向 MQTT 导出：`{prefix}/{deviceKey}/{data|event|status}`。

use crate::IngestError;
use crate::push::NorthboundPush;
use async_trait::async_trait;
use domain::{DataMap, Device, DeviceStatus, now_epoch_ms};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct NorthboundConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
}

#[derive(Clone)]
pub struct MqttNorthbound {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttNorthbound {
    /// 建立客户端并返回事件循环任务句柄。
    pub fn connect(config: NorthboundConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let client_id = format!("gw-northbound-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!(target: "gw.ingest", error = %err, "northbound_eventloop_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        (
            Self {
                client,
                topic_prefix: config.topic_prefix,
            },
            handle,
        )
    }

    pub fn topic_for(&self, device_key: &str, kind: &str) -> String {
        northbound_topic(&self.topic_prefix, device_key, kind)
    }

    async fn publish(&self, device: &Device, kind: &str, body: Value) -> Result<(), IngestError> {
        let topic = self.topic_for(&device.device_key, kind);
        let payload = serde_json::to_vec(&body).map_err(|err| IngestError::Northbound(err.to_string()))?;
        debug!(
            target: "gw.ingest",
            device_key = %device.device_key,
            topic = %topic,
            bytes = payload.len(),
            "northbound_publish"
        );
        // 请求通道满（北向 Broker 不可达）时立即失败，不阻塞接入路径
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| IngestError::Northbound(err.to_string()))
    }
}

pub fn northbound_topic(prefix: &str, device_key: &str, kind: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{device_key}/{kind}")
    } else {
        format!("{prefix}/{device_key}/{kind}")
    }
}

fn envelope(device: &Device, key: &str, value: Value) -> Value {
    json!({
        "deviceId": device.id,
        "deviceKey": device.device_key,
        "productKey": device.product_key,
        key: value,
        "timestamp": now_epoch_ms(),
    })
}

#[async_trait]
impl NorthboundPush for MqttNorthbound {
    async fn push_data(&self, device: &Device, data: &DataMap) -> Result<(), IngestError> {
        let body = envelope(device, "data", Value::Object(data.clone()));
        self.publish(device, "data", body).await
    }

    async fn push_event(&self, device: &Device, data: &DataMap) -> Result<(), IngestError> {
        let body = envelope(device, "event", Value::Object(data.clone()));
        self.publish(device, "event", body).await
    }

    async fn push_status(&self, device: &Device, status: DeviceStatus) -> Result<(), IngestError> {
        let body = envelope(device, "status", json!(status.as_str()));
        self.publish(device, "status", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_join_prefix_device_and_kind() {
        assert_eq!(northbound_topic("iot/up/", "meter-01", "data"), "iot/up/meter-01/data");
        assert_eq!(northbound_topic("", "meter-01", "status"), "meter-01/status");
    }

    #[tokio::test]
    async fn unreachable_broker_never_blocks_publishing() {
        let (northbound, task) = MqttNorthbound::connect(NorthboundConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: None,
            password: None,
            topic_prefix: "iot/up".to_string(),
        });
        let device = Device::new("d-1", "meter-01", "pk-1");
        let mut data = DataMap::new();
        data.insert("temp".to_string(), json!(20));

        let results = tokio::time::timeout(Duration::from_secs(2), async {
            let mut results = Vec::new();
            for _ in 0..(REQUEST_CAPACITY + 36) {
                results.push(northbound.push_data(&device, &data).await);
            }
            results
        })
        .await
        .expect("publishing returns while the broker is down");

        assert_eq!(results.len(), 100);
        assert!(results[0].is_ok());
        assert!(matches!(results[99], Err(IngestError::Northbound(_))));
        task.abort();
    }

    #[test]
    fn envelope_carries_device_identity() {
        let device = Device::new("d-1", "meter-01", "pk-1");
        let body = envelope(&device, "status", json!("ONLINE"));
        assert_eq!(body["deviceKey"], "meter-01");
        assert_eq!(body["status"], "ONLINE");
        assert!(body["timestamp"].as_i64().is_some());
    }
}
