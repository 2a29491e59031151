//! 追踪初始化、连接 ID 生成与进程级计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub queue_offered: u64,
    pub queue_dropped: u64,
    pub queue_unhandled: u64,
    pub driver_starts: u64,
    pub driver_stops: u64,
    pub driver_errors: u64,
    pub mqtt_connects: u64,
    pub mqtt_rejects: u64,
    pub mqtt_publishes: u64,
    pub modbus_pool_refused: u64,
    pub s7_offline_transitions: u64,
    pub shadow_flushes: u64,
    pub audit_rows_flushed: u64,
    pub northbound_failures: u64,
    pub topo_rejects: u64,
}

/// 基础指标。
pub struct TelemetryMetrics {
    queue_offered: AtomicU64,
    queue_dropped: AtomicU64,
    queue_unhandled: AtomicU64,
    driver_starts: AtomicU64,
    driver_stops: AtomicU64,
    driver_errors: AtomicU64,
    mqtt_connects: AtomicU64,
    mqtt_rejects: AtomicU64,
    mqtt_publishes: AtomicU64,
    modbus_pool_refused: AtomicU64,
    s7_offline_transitions: AtomicU64,
    shadow_flushes: AtomicU64,
    audit_rows_flushed: AtomicU64,
    northbound_failures: AtomicU64,
    topo_rejects: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            queue_offered: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            queue_unhandled: AtomicU64::new(0),
            driver_starts: AtomicU64::new(0),
            driver_stops: AtomicU64::new(0),
            driver_errors: AtomicU64::new(0),
            mqtt_connects: AtomicU64::new(0),
            mqtt_rejects: AtomicU64::new(0),
            mqtt_publishes: AtomicU64::new(0),
            modbus_pool_refused: AtomicU64::new(0),
            s7_offline_transitions: AtomicU64::new(0),
            shadow_flushes: AtomicU64::new(0),
            audit_rows_flushed: AtomicU64::new(0),
            northbound_failures: AtomicU64::new(0),
            topo_rejects: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_offered: self.queue_offered.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            queue_unhandled: self.queue_unhandled.load(Ordering::Relaxed),
            driver_starts: self.driver_starts.load(Ordering::Relaxed),
            driver_stops: self.driver_stops.load(Ordering::Relaxed),
            driver_errors: self.driver_errors.load(Ordering::Relaxed),
            mqtt_connects: self.mqtt_connects.load(Ordering::Relaxed),
            mqtt_rejects: self.mqtt_rejects.load(Ordering::Relaxed),
            mqtt_publishes: self.mqtt_publishes.load(Ordering::Relaxed),
            modbus_pool_refused: self.modbus_pool_refused.load(Ordering::Relaxed),
            s7_offline_transitions: self.s7_offline_transitions.load(Ordering::Relaxed),
            shadow_flushes: self.shadow_flushes.load(Ordering::Relaxed),
            audit_rows_flushed: self.audit_rows_flushed.load(Ordering::Relaxed),
            northbound_failures: self.northbound_failures.load(Ordering::Relaxed),
            topo_rejects: self.topo_rejects.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成连接级追踪 ID（用于 MQTT/TCP 会话 span）。
pub fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录入队成功次数。
pub fn record_queue_offered() {
    metrics().queue_offered.fetch_add(1, Ordering::Relaxed);
}

/// 记录队列满丢弃次数。
pub fn record_queue_dropped() {
    metrics().queue_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录无处理器丢弃次数。
pub fn record_queue_unhandled() {
    metrics().queue_unhandled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_driver_start() {
    metrics().driver_starts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_driver_stop() {
    metrics().driver_stops.fetch_add(1, Ordering::Relaxed);
}

pub fn record_driver_error() {
    metrics().driver_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 连接成功次数（CONNACK accepted）。
pub fn record_mqtt_connect() {
    metrics().mqtt_connects.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 连接拒绝次数（版本/认证失败）。
pub fn record_mqtt_reject() {
    metrics().mqtt_rejects.fetch_add(1, Ordering::Relaxed);
}

pub fn record_mqtt_publish() {
    metrics().mqtt_publishes.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接池已满拒绝次数。
pub fn record_modbus_pool_refused() {
    metrics()
        .modbus_pool_refused
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_s7_offline_transition() {
    metrics()
        .s7_offline_transitions
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录影子批量刷新次数。
pub fn record_shadow_flush() {
    metrics().shadow_flushes.fetch_add(1, Ordering::Relaxed);
}

/// 记录审计行批量写入条数。
pub fn record_audit_rows_flushed(rows: u64) {
    metrics()
        .audit_rows_flushed
        .fetch_add(rows, Ordering::Relaxed);
}

pub fn record_northbound_failure() {
    metrics()
        .northbound_failures
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录网关拓扑校验拒绝次数。
pub fn record_topo_reject() {
    metrics().topo_rejects.fetch_add(1, Ordering::Relaxed);
}
