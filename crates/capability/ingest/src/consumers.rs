//! 队列消费处理器：设备数据 → 规则触发、告警 → 通知、通知发送、规则评估与指令下发。

use crate::IngestError;
use async_trait::async_trait;
use domain::{DataMap, command_down_topic};
use gw_driver::DeviceDownlink;
use gw_pipeline::{
    AlarmMessage, CommandMessage, DeviceDataMessage, HandlerError, MessageHandler, MessageQueue,
    NotificationMessage, RuleTriggerMessage,
};
use gw_storage::DeviceStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 规则评估协作方。
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, source_id: &str, data: &DataMap) -> Result<(), IngestError>;
}

/// 通知发送协作方（邮件、短信等）。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, data: &DataMap) -> Result<(), IngestError>;
}

/// 只记录日志的规则评估。
#[derive(Debug, Default)]
pub struct LoggingRuleEvaluator;

#[async_trait]
impl RuleEvaluator for LoggingRuleEvaluator {
    async fn evaluate(&self, source_id: &str, data: &DataMap) -> Result<(), IngestError> {
        debug!(target: "gw.queue", source_id, keys = data.len(), "rule_evaluated");
        Ok(())
    }
}

/// 只记录日志的通知发送。
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, channel: &str, data: &DataMap) -> Result<(), IngestError> {
        let subject = data.get("subject").and_then(Value::as_str).unwrap_or_default();
        info!(target: "gw.queue", channel, subject, "notification_sent");
        Ok(())
    }
}

/// 设备数据 → 规则触发（触发源为设备 ID）。
pub struct DeviceDataConsumer {
    devices: Arc<dyn DeviceStore>,
    queue: MessageQueue,
}

impl DeviceDataConsumer {
    pub fn new(devices: Arc<dyn DeviceStore>, queue: MessageQueue) -> Self {
        Self { devices, queue }
    }
}

#[async_trait]
impl MessageHandler<DeviceDataMessage> for DeviceDataConsumer {
    async fn handle(&self, message: DeviceDataMessage) -> Result<(), HandlerError> {
        let device = self
            .devices
            .find_by_key(&message.device_key)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))?;
        let Some(device) = device else {
            warn!(target: "gw.queue", device_key = %message.device_key, "rule_trigger_device_missing");
            return Ok(());
        };
        if !self
            .queue
            .send_rule_trigger(RuleTriggerMessage::new(device.id, message.data))
        {
            warn!(target: "gw.queue", device_key = %message.device_key, "rule_trigger_enqueue_failed");
        }
        Ok(())
    }
}

/// 告警处理：离线告警转邮件通知，设备告警事件记录。
pub struct AlarmConsumer {
    queue: MessageQueue,
}

impl AlarmConsumer {
    pub fn new(queue: MessageQueue) -> Self {
        Self { queue }
    }
}

fn text<'a>(data: &'a DataMap, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[async_trait]
impl MessageHandler<AlarmMessage> for AlarmConsumer {
    async fn handle(&self, message: AlarmMessage) -> Result<(), HandlerError> {
        match message.alarm_type.as_str() {
            crate::handler::OFFLINE_ALARM_TYPE => {
                let data = &message.alarm_data;
                let mut notification = DataMap::new();
                notification.insert("subject".to_string(), json!("设备离线告警"));
                notification.insert(
                    "content".to_string(),
                    json!(format!(
                        "设备[{}]已离线，IP地址：{}",
                        text(data, "deviceName"),
                        text(data, "ipAddress")
                    )),
                );
                notification.insert(
                    "deviceKey".to_string(),
                    data.get("deviceKey").cloned().unwrap_or(Value::Null),
                );
                if !self
                    .queue
                    .send_notification(NotificationMessage::new("email", notification))
                {
                    warn!(target: "gw.queue", "offline_notification_enqueue_failed");
                }
            }
            "alarm" => {
                warn!(
                    target: "gw.queue",
                    device_key = text(&message.alarm_data, "deviceKey"),
                    priority = message.priority,
                    "device_alarm"
                );
            }
            other => {
                warn!(target: "gw.queue", alarm_type = other, "alarm_type_unknown");
            }
        }
        Ok(())
    }
}

pub struct RuleConsumer {
    evaluator: Arc<dyn RuleEvaluator>,
}

impl RuleConsumer {
    pub fn new(evaluator: Arc<dyn RuleEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl MessageHandler<RuleTriggerMessage> for RuleConsumer {
    async fn handle(&self, message: RuleTriggerMessage) -> Result<(), HandlerError> {
        self.evaluator
            .evaluate(&message.source_id, &message.trigger_data)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))
    }
}

pub struct NotificationConsumer {
    notifier: Arc<dyn Notifier>,
}

impl NotificationConsumer {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl MessageHandler<NotificationMessage> for NotificationConsumer {
    async fn handle(&self, message: NotificationMessage) -> Result<(), HandlerError> {
        self.notifier
            .notify(&message.notification_type, &message.data)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))
    }
}

/// 指令下发到 `/{productKey}/{deviceKey}/command/down`。
pub struct CommandConsumer {
    devices: Arc<dyn DeviceStore>,
    downlink: Arc<dyn DeviceDownlink>,
}

impl CommandConsumer {
    pub fn new(devices: Arc<dyn DeviceStore>, downlink: Arc<dyn DeviceDownlink>) -> Self {
        Self { devices, downlink }
    }
}

#[async_trait]
impl MessageHandler<CommandMessage> for CommandConsumer {
    async fn handle(&self, message: CommandMessage) -> Result<(), HandlerError> {
        let device = self
            .devices
            .find_by_key(&message.device_key)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))?
            .ok_or_else(|| HandlerError::new(format!("device not found: {}", message.device_key)))?;
        let topic = command_down_topic(&device.product_key, &device.device_key);
        let payload = Value::Object(message.command).to_string();
        if self
            .downlink
            .send_to_device(&device.device_key, &topic, payload.as_bytes())
            .await
        {
            info!(target: "gw.queue", device_key = %device.device_key, topic = %topic, "command_sent");
            Ok(())
        } else {
            Err(HandlerError::new(format!(
                "device not connected: {}",
                device.device_key
            )))
        }
    }
}

/// 在队列上注册全部消费处理器。
pub fn register_consumers(
    queue: &MessageQueue,
    devices: Arc<dyn DeviceStore>,
    downlink: Arc<dyn DeviceDownlink>,
    evaluator: Arc<dyn RuleEvaluator>,
    notifier: Arc<dyn Notifier>,
) {
    queue.register_device_data_handler(Arc::new(DeviceDataConsumer::new(
        Arc::clone(&devices),
        queue.clone(),
    )));
    queue.register_alarm_handler(Arc::new(AlarmConsumer::new(queue.clone())));
    queue.register_rule_handler(Arc::new(RuleConsumer::new(evaluator)));
    queue.register_notification_handler(Arc::new(NotificationConsumer::new(notifier)));
    queue.register_command_handler(Arc::new(CommandConsumer::new(devices, downlink)));
}
