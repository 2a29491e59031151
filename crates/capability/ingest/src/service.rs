//! 设备消息服务：接入鉴权、上下线与按 Topic 类别分发。

use crate::handler::{DeviceDataHandler, payload_object};
use crate::topology::GatewayTopologyRouter;
use crate::IngestError;
use async_trait::async_trait;
use domain::{DataMap, Device, DeviceStatus, DeviceTopic, TopicKind, now_epoch_ms};
use gw_driver::{DeviceDownlink, DeviceMessageSink};
use gw_storage::DeviceStore;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

pub struct DeviceMessageService {
    devices: Arc<dyn DeviceStore>,
    handler: Arc<DeviceDataHandler>,
    router: GatewayTopologyRouter,
    downlink: Arc<dyn DeviceDownlink>,
}

fn secret_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

impl DeviceMessageService {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        handler: Arc<DeviceDataHandler>,
        router: GatewayTopologyRouter,
        downlink: Arc<dyn DeviceDownlink>,
    ) -> Self {
        Self {
            devices,
            handler,
            router,
            downlink,
        }
    }

    pub fn handler(&self) -> &Arc<DeviceDataHandler> {
        &self.handler
    }

    /// 服务端主动下发；设备不在线返回 false。
    pub async fn send_to_device(&self, device_key: &str, topic: &str, message: &str) -> bool {
        let sent = self
            .downlink
            .send_to_device(device_key, topic, message.as_bytes())
            .await;
        if sent {
            info!(target: "gw.ingest", device_key, topic, "downlink_sent");
        } else {
            warn!(target: "gw.ingest", device_key, topic, "downlink_device_not_connected");
        }
        sent
    }

    async fn find_device(&self, device_key: &str) -> Result<Option<Device>, IngestError> {
        Ok(self.devices.find_by_key(device_key).await?)
    }

    async fn change_status(
        &self,
        device_key: &str,
        status: DeviceStatus,
        ip_address: Option<&str>,
    ) -> Result<Option<Device>, IngestError> {
        let Some(device) = self.find_device(device_key).await? else {
            return Ok(None);
        };
        let Some(mut updated) = self
            .devices
            .update_status(&device.id, status, now_epoch_ms())
            .await?
        else {
            return Ok(None);
        };
        if let Some(ip) = ip_address {
            updated.ip_address = Some(ip.to_string());
            self.devices.save_device(updated.clone()).await?;
        }
        Ok(Some(updated))
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        let Some(parsed) = DeviceTopic::parse(topic) else {
            warn!(target: "gw.ingest", topic, "topic_malformed");
            return Ok(());
        };
        let data = payload_object(payload)?;
        let Some(device) = self.find_device(&parsed.device_key).await? else {
            warn!(target: "gw.ingest", device_key = %parsed.device_key, "device_not_found");
            return Ok(());
        };

        match parsed.kind {
            TopicKind::Property => self.handler.handle_property_data(&device, data).await,
            TopicKind::Event => self.handler.handle_event_data(&device, data).await,
            TopicKind::Response => self.handler.handle_command_response(&device, data).await,
            TopicKind::Gateway => {
                if let Some((target, data)) = self.router.route_gateway_data(&device, data).await? {
                    self.handler.handle_property_data(&target, data).await;
                }
            }
            TopicKind::Topo => {
                self.router.handle_topo(&device, &data).await;
            }
            TopicKind::Command => {
                debug!(target: "gw.ingest", device_key = %device.device_key, "command_topic_ignored");
            }
            TopicKind::Other(kind) => {
                warn!(target: "gw.ingest", device_key = %device.device_key, kind = %kind, "message_kind_unknown");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceMessageSink for DeviceMessageService {
    async fn authenticate(&self, client_id: &str, _username: &str, password: &str) -> bool {
        let device = match self.find_device(client_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(target: "gw.ingest", device_key = client_id, "auth_device_not_found");
                return false;
            }
            Err(err) => {
                error!(target: "gw.ingest", device_key = client_id, error = %err, "auth_lookup_failed");
                return false;
            }
        };
        if !secret_matches(&device.device_secret, password) {
            warn!(target: "gw.ingest", device_key = client_id, "auth_secret_mismatch");
            return false;
        }
        if device.status == DeviceStatus::Disable {
            warn!(target: "gw.ingest", device_key = client_id, "auth_device_disabled");
            return false;
        }
        info!(target: "gw.ingest", device_key = client_id, device_name = %device.device_name, "auth_accepted");
        true
    }

    async fn device_online(&self, device_key: &str, ip_address: Option<&str>) {
        match self
            .change_status(device_key, DeviceStatus::Online, ip_address)
            .await
        {
            Ok(Some(device)) => {
                self.handler
                    .push_device_status(&device, DeviceStatus::Online)
                    .await;
                info!(target: "gw.ingest", device_key, ip = ?ip_address, "device_online");
            }
            Ok(None) => {
                debug!(target: "gw.ingest", device_key, "online_unknown_device");
            }
            Err(err) => {
                error!(target: "gw.ingest", device_key, error = %err, "device_online_failed");
            }
        }
    }

    async fn device_offline(&self, device_key: &str) {
        match self
            .change_status(device_key, DeviceStatus::Offline, None)
            .await
        {
            Ok(Some(device)) => {
                self.handler
                    .push_device_status(&device, DeviceStatus::Offline)
                    .await;
                info!(target: "gw.ingest", device_key, "device_offline");
            }
            Ok(None) => {
                debug!(target: "gw.ingest", device_key, "offline_unknown_device");
            }
            Err(err) => {
                error!(target: "gw.ingest", device_key, error = %err, "device_offline_failed");
            }
        }
    }

    async fn handle_device_message(&self, topic: &str, payload: &[u8]) {
        if let Err(err) = self.dispatch(topic, payload).await {
            error!(target: "gw.ingest", topic, error = %err, "device_message_failed");
        }
    }

    async fn report_property(&self, device: &Device, data: DataMap) {
        self.handler.handle_property_data(device, data).await;
    }

    async fn report_event(&self, device: &Device, data: DataMap) {
        self.handler.handle_event_data(device, data).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_compare_requires_exact_match() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cre"));
        assert!(!secret_matches("s3cret", "S3cret"));
        assert!(!secret_matches("", "x"));
    }
}
