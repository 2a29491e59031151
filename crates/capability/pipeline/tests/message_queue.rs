use async_trait::async_trait;
use domain::DataMap;
use gw_pipeline::{
    AlarmMessage, DeviceDataMessage, HandlerError, MessageHandler, MessageQueue, QueueConfig,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    keys: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler<DeviceDataMessage> for Recorder {
    async fn handle(&self, message: DeviceDataMessage) -> Result<(), HandlerError> {
        self.keys
            .lock()
            .map_err(|_| HandlerError::new("lock"))?
            .push(message.device_key);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler<AlarmMessage> for Recorder {
    async fn handle(&self, message: AlarmMessage) -> Result<(), HandlerError> {
        self.keys
            .lock()
            .map_err(|_| HandlerError::new("lock"))?
            .push(message.alarm_type);
        Ok(())
    }
}

fn data(value: i64) -> DataMap {
    let mut map = DataMap::new();
    map.insert("temp".to_string(), json!(value));
    map
}

fn small_config() -> QueueConfig {
    QueueConfig {
        device_data_capacity: 2,
        alarm_capacity: 3,
        rule_capacity: 1,
        notification_capacity: 1,
        command_capacity: 1,
        consumer_threads: 1,
    }
}

#[test]
fn full_queue_drops_new_messages() {
    let queue = MessageQueue::new(small_config());
    assert!(queue.send_device_data(DeviceDataMessage::new("d1", data(1))));
    assert!(queue.send_device_data(DeviceDataMessage::new("d2", data(2))));
    assert!(!queue.send_device_data(DeviceDataMessage::new("d3", data(3))));
    assert_eq!(queue.queue_status().device_data, 2);
}

#[test]
fn clear_all_empties_every_queue() {
    let queue = MessageQueue::new(small_config());
    queue.send_device_data(DeviceDataMessage::new("d1", data(1)));
    queue.send_alarm(AlarmMessage::new("alarm", data(1), 8));
    queue.clear_all();
    assert_eq!(queue.queue_status(), Default::default());
}

#[tokio::test]
async fn workers_deliver_to_registered_handler() {
    let queue = MessageQueue::new(small_config());
    let recorder = Arc::new(Recorder::default());
    queue.register_device_data_handler(recorder.clone());
    queue.start();
    queue.send_device_data(DeviceDataMessage::new("meter-01", data(25)));

    for _ in 0..50 {
        if !recorder.keys.lock().expect("lock").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.shutdown().await;
    assert_eq!(recorder.keys.lock().expect("lock").as_slice(), ["meter-01"]);
    assert!(!queue.is_running());
}

#[tokio::test]
async fn queued_alarms_reach_late_registered_handler() {
    let queue = MessageQueue::new(small_config());
    queue.send_alarm(AlarmMessage::new("info", data(1), 1));
    queue.send_alarm(AlarmMessage::new("DEVICE_OFFLINE", data(2), 5));
    queue.send_alarm(AlarmMessage::new("alarm", data(3), 8));

    let recorder = Arc::new(Recorder::default());
    queue.register_alarm_handler(recorder.clone());
    queue.start();
    for _ in 0..50 {
        if recorder.keys.lock().expect("lock").len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.shutdown().await;

    // 两个告警消费任务可能交错，出队顺序由队列单测覆盖，这里只校验全部送达
    let keys = recorder.keys.lock().expect("lock").clone();
    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&"alarm".to_string()));
    assert!(keys.contains(&"info".to_string()));
}

#[tokio::test]
async fn messages_without_handler_are_dropped() {
    let queue = MessageQueue::new(small_config());
    queue.send_device_data(DeviceDataMessage::new("orphan", data(1)));
    queue.start();
    for _ in 0..50 {
        if queue.queue_status().device_data == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.shutdown().await;
    assert_eq!(queue.queue_status().device_data, 0);
}
