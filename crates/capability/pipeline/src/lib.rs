//! 进程内消息队列：设备数据、告警、规则触发、通知、设备指令五条有界队列。
//!
//! - 入队非阻塞：队列满则丢弃并告警
//! - 告警队列按优先级出队，其余 FIFO
//! - 每条队列由固定数量的消费任务以 1s 超时轮询
//! - 未注册处理器的消息被丢弃并记录

pub mod message;
pub mod queue;

pub use message::*;
pub use queue::BoundedQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// 告警优先级上限。
pub const MAX_ALARM_PRIORITY: u8 = 10;

/// 队列参数。
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub device_data_capacity: usize,
    pub alarm_capacity: usize,
    pub rule_capacity: usize,
    pub notification_capacity: usize,
    pub command_capacity: usize,
    /// 设备数据消费任务数；告警/规则取其一半（至少 2）
    pub consumer_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            device_data_capacity: 10_000,
            alarm_capacity: 5_000,
            rule_capacity: 5_000,
            notification_capacity: 3_000,
            command_capacity: 3_000,
            consumer_threads: 4,
        }
    }
}

impl QueueConfig {
    fn sanitized(mut self) -> Self {
        if self.consumer_threads == 0 {
            self.consumer_threads = 1;
        }
        self
    }

    fn half_threads(&self) -> usize {
        (self.consumer_threads / 2).max(2)
    }
}

/// 各队列当前长度。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub device_data: usize,
    pub alarm: usize,
    pub rule: usize,
    pub notification: usize,
    pub command: usize,
}

struct Channel<M: Send + 'static> {
    queue: BoundedQueue<M>,
    handler: RwLock<Option<Arc<dyn MessageHandler<M>>>>,
}

impl<M: Send + 'static> Channel<M> {
    fn new(queue: BoundedQueue<M>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            handler: RwLock::new(None),
        })
    }

    fn register(&self, handler: Arc<dyn MessageHandler<M>>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
        info!(target: "gw.queue", queue = self.queue.name(), "handler_registered");
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler<M>>> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    fn offer(&self, message: M, priority: u8) -> bool {
        if self.queue.offer(message, priority) {
            gw_telemetry::record_queue_offered();
            true
        } else {
            gw_telemetry::record_queue_dropped();
            warn!(
                target: "gw.queue",
                queue = self.queue.name(),
                capacity = self.queue.capacity(),
                "queue_full_message_dropped"
            );
            false
        }
    }
}

fn spawn_workers<M: Send + 'static>(
    channel: &Arc<Channel<M>>,
    count: usize,
    running: &Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let channel = Arc::clone(channel);
            let running = Arc::clone(running);
            tokio::spawn(async move {
                debug!(target: "gw.queue", queue = channel.queue.name(), worker, "worker_started");
                while running.load(Ordering::SeqCst) {
                    let Some(message) = channel.queue.poll(POLL_TIMEOUT).await else {
                        continue;
                    };
                    match channel.handler() {
                        Some(handler) => {
                            if let Err(err) = handler.handle(message).await {
                                error!(
                                    target: "gw.queue",
                                    queue = channel.queue.name(),
                                    error = %err,
                                    "handler_failed"
                                );
                            }
                        }
                        None => {
                            gw_telemetry::record_queue_unhandled();
                            warn!(
                                target: "gw.queue",
                                queue = channel.queue.name(),
                                "no_handler_message_dropped"
                            );
                        }
                    }
                }
                debug!(target: "gw.queue", queue = channel.queue.name(), worker, "worker_stopped");
            })
        })
        .collect()
}

struct MessageQueueInner {
    config: QueueConfig,
    device_data: Arc<Channel<DeviceDataMessage>>,
    alarm: Arc<Channel<AlarmMessage>>,
    rule: Arc<Channel<RuleTriggerMessage>>,
    notification: Arc<Channel<NotificationMessage>>,
    command: Arc<Channel<CommandMessage>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// 进程内消息队列入口。
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<MessageQueueInner>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = config.sanitized();
        let inner = MessageQueueInner {
            device_data: Channel::new(BoundedQueue::fifo(
                "device_data",
                config.device_data_capacity,
            )),
            alarm: Channel::new(BoundedQueue::priority("alarm", config.alarm_capacity)),
            rule: Channel::new(BoundedQueue::fifo("rule", config.rule_capacity)),
            notification: Channel::new(BoundedQueue::fifo(
                "notification",
                config.notification_capacity,
            )),
            command: Channel::new(BoundedQueue::fifo("command", config.command_capacity)),
            config,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn register_device_data_handler(&self, handler: Arc<dyn MessageHandler<DeviceDataMessage>>) {
        self.inner.device_data.register(handler);
    }

    pub fn register_alarm_handler(&self, handler: Arc<dyn MessageHandler<AlarmMessage>>) {
        self.inner.alarm.register(handler);
    }

    pub fn register_rule_handler(&self, handler: Arc<dyn MessageHandler<RuleTriggerMessage>>) {
        self.inner.rule.register(handler);
    }

    pub fn register_notification_handler(
        &self,
        handler: Arc<dyn MessageHandler<NotificationMessage>>,
    ) {
        self.inner.notification.register(handler);
    }

    pub fn register_command_handler(&self, handler: Arc<dyn MessageHandler<CommandMessage>>) {
        self.inner.command.register(handler);
    }

    pub fn send_device_data(&self, message: DeviceDataMessage) -> bool {
        self.inner.device_data.offer(message, 0)
    }

    /// 告警入队；优先级截断到 0..=10。
    pub fn send_alarm(&self, mut message: AlarmMessage) -> bool {
        message.priority = message.priority.min(MAX_ALARM_PRIORITY);
        let priority = message.priority;
        self.inner.alarm.offer(message, priority)
    }

    pub fn send_rule_trigger(&self, message: RuleTriggerMessage) -> bool {
        self.inner.rule.offer(message, 0)
    }

    pub fn send_notification(&self, message: NotificationMessage) -> bool {
        self.inner.notification.offer(message, 0)
    }

    pub fn send_command(&self, message: CommandMessage) -> bool {
        self.inner.command.offer(message, 0)
    }

    /// 启动消费任务；重复调用无效果。需在 tokio 运行时内调用。
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        let half = inner.config.half_threads();
        let mut handles = Vec::new();
        handles.extend(spawn_workers(
            &inner.device_data,
            inner.config.consumer_threads,
            &inner.running,
        ));
        handles.extend(spawn_workers(&inner.alarm, half, &inner.running));
        handles.extend(spawn_workers(&inner.rule, half, &inner.running));
        handles.extend(spawn_workers(&inner.notification, 2, &inner.running));
        handles.extend(spawn_workers(&inner.command, 2, &inner.running));
        let worker_count = handles.len();
        if let Ok(mut workers) = inner.workers.lock() {
            workers.extend(handles);
        }
        info!(target: "gw.queue", workers = worker_count, "message_queue_started");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            device_data: self.inner.device_data.queue.len(),
            alarm: self.inner.alarm.queue.len(),
            rule: self.inner.rule.queue.len(),
            notification: self.inner.notification.queue.len(),
            command: self.inner.command.queue.len(),
        }
    }

    pub fn clear_all(&self) {
        self.inner.device_data.queue.clear();
        self.inner.alarm.queue.clear();
        self.inner.rule.queue.clear();
        self.inner.notification.queue.clear();
        self.inner.command.queue.clear();
        info!(target: "gw.queue", "message_queue_cleared");
    }

    /// 停止消费并等待任务退出（最长约一个轮询周期）。
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles = match self.inner.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!(target: "gw.queue", "message_queue_stopped");
    }
}
