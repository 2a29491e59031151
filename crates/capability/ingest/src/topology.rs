//! 网关拓扑：子设备数据路由与拓扑管理（add / delete / get）。
//!
//! 子设备数据只有在子设备存在且与网关存在拓扑边时才被接受。

use crate::IngestError;
use domain::{DataMap, Device, TopoEdge, now_epoch_ms, property_post_topic, topo_response_topic};
use gw_driver::DeviceDownlink;
use gw_storage::{DeviceStore, TopoStore};
use gw_telemetry::record_topo_reject;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILED: &str = "failed";

pub struct GatewayTopologyRouter {
    devices: Arc<dyn DeviceStore>,
    topology: Arc<dyn TopoStore>,
    downlink: Arc<dyn DeviceDownlink>,
}

impl GatewayTopologyRouter {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        topology: Arc<dyn TopoStore>,
        downlink: Arc<dyn DeviceDownlink>,
    ) -> Self {
        Self {
            devices,
            topology,
            downlink,
        }
    }

    /// 网关上报路由：返回实际归属的设备与属性数据；拒绝时返回 None。
    ///
    /// 无 `subDeviceKey` 时整包视为网关自身属性。
    pub async fn route_gateway_data(
        &self,
        gateway: &Device,
        data: DataMap,
    ) -> Result<Option<(Device, DataMap)>, IngestError> {
        let Some(sub_device_key) = data.get("subDeviceKey").and_then(Value::as_str) else {
            debug!(
                target: "gw.topo",
                gateway_key = %gateway.device_key,
                topic = %property_post_topic(&gateway.product_key, &gateway.device_key),
                "gateway_self_data"
            );
            return Ok(Some((gateway.clone(), data)));
        };

        let Some(sub_device) = self.devices.find_by_key(sub_device_key).await? else {
            record_topo_reject();
            warn!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key, "sub_device_not_found");
            return Ok(None);
        };
        if self
            .topology
            .find_edge(&gateway.id, &sub_device.id)
            .await?
            .is_none()
        {
            record_topo_reject();
            warn!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key, "topo_edge_missing");
            return Ok(None);
        }

        let Some(Value::Object(payload)) = data.get("data") else {
            warn!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key, "sub_device_data_missing");
            return Ok(None);
        };
        info!(
            target: "gw.topo",
            gateway_key = %gateway.device_key,
            sub_device_key,
            topic = %property_post_topic(&sub_device.product_key, &sub_device.device_key),
            "sub_device_data_routed"
        );
        Ok(Some((sub_device, payload.clone())))
    }

    /// 拓扑管理；应答下发到 `/{gatewayKey}/topo/response` 并返回应答体。
    pub async fn handle_topo(&self, gateway: &Device, data: &DataMap) -> DataMap {
        let action = data.get("action").and_then(Value::as_str).unwrap_or_default();
        let sub_device_key = data.get("subDeviceKey").and_then(Value::as_str);

        let response = match action {
            "add" => {
                let result = self.bind(gateway, sub_device_key).await;
                ack(action, result, sub_device_key)
            }
            "delete" => {
                let result = self.unbind(gateway, sub_device_key).await;
                ack(action, result, sub_device_key)
            }
            "get" => self.sub_device_list(gateway).await,
            other => {
                warn!(target: "gw.topo", gateway_key = %gateway.device_key, action = other, "topo_action_unknown");
                ack(other, RESULT_FAILED, sub_device_key)
            }
        };

        let topic = topo_response_topic(&gateway.device_key);
        let body = Value::Object(response.clone()).to_string();
        let sent = self
            .downlink
            .send_to_device(&gateway.device_key, &topic, body.as_bytes())
            .await;
        if !sent {
            warn!(target: "gw.topo", gateway_key = %gateway.device_key, "topo_response_not_delivered");
        }
        response
    }

    async fn bind(&self, gateway: &Device, sub_device_key: Option<&str>) -> &'static str {
        let Some(sub_device) = self.lookup(sub_device_key).await else {
            warn!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key, "topo_add_unknown_device");
            return RESULT_FAILED;
        };
        let edge = TopoEdge {
            gateway_id: gateway.id.clone(),
            sub_device_id: sub_device.id.clone(),
            bind_time_ms: now_epoch_ms(),
        };
        match self.topology.bind(edge).await {
            Ok(()) => {
                info!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key = %sub_device.device_key, "sub_device_bound");
                RESULT_SUCCESS
            }
            Err(err) => {
                warn!(target: "gw.topo", gateway_key = %gateway.device_key, error = %err, "topo_bind_failed");
                RESULT_FAILED
            }
        }
    }

    /// 子设备不存在时视为已解绑。
    async fn unbind(&self, gateway: &Device, sub_device_key: Option<&str>) -> &'static str {
        let Some(sub_device) = self.lookup(sub_device_key).await else {
            return RESULT_SUCCESS;
        };
        match self.topology.unbind(&gateway.id, &sub_device.id).await {
            Ok(existed) => {
                info!(target: "gw.topo", gateway_key = %gateway.device_key, sub_device_key = %sub_device.device_key, existed, "sub_device_unbound");
                RESULT_SUCCESS
            }
            Err(err) => {
                warn!(target: "gw.topo", gateway_key = %gateway.device_key, error = %err, "topo_unbind_failed");
                RESULT_FAILED
            }
        }
    }

    async fn lookup(&self, device_key: Option<&str>) -> Option<Device> {
        let device_key = device_key?;
        match self.devices.find_by_key(device_key).await {
            Ok(device) => device,
            Err(err) => {
                warn!(target: "gw.topo", device_key, error = %err, "device_lookup_failed");
                None
            }
        }
    }

    async fn sub_device_list(&self, gateway: &Device) -> DataMap {
        let edges = match self.topology.list_sub_devices(&gateway.id).await {
            Ok(edges) => edges,
            Err(err) => {
                warn!(target: "gw.topo", gateway_key = %gateway.device_key, error = %err, "topo_list_failed");
                return ack("get", RESULT_FAILED, None);
            }
        };

        let mut sub_devices = Vec::with_capacity(edges.len());
        for edge in edges {
            match self.devices.find_by_id(&edge.sub_device_id).await {
                Ok(Some(device)) => sub_devices.push(json!({
                    "deviceKey": device.device_key,
                    "deviceName": device.device_name,
                    "deviceStatus": device.status.as_str(),
                    "productId": device.product_id,
                })),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "gw.topo", sub_device_id = %edge.sub_device_id, error = %err, "device_lookup_failed");
                }
            }
        }

        let mut response = DataMap::new();
        response.insert("action".to_string(), json!("get"));
        response.insert("result".to_string(), json!(RESULT_SUCCESS));
        response.insert("count".to_string(), json!(sub_devices.len()));
        response.insert("subDevices".to_string(), Value::Array(sub_devices));
        response.insert("timestamp".to_string(), json!(now_epoch_ms()));
        response
    }
}

fn ack(action: &str, result: &str, sub_device_key: Option<&str>) -> DataMap {
    let mut response = DataMap::new();
    response.insert("action".to_string(), json!(action));
    response.insert("result".to_string(), json!(result));
    response.insert("subDeviceKey".to_string(), json!(sub_device_key));
    response.insert("timestamp".to_string(), json!(now_epoch_ms()));
    response
}
