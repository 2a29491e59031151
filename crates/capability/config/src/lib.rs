//! 网关运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 各消息队列容量。
#[derive(Debug, Clone)]
pub struct QueueCapacities {
    pub device_data: usize,
    pub alarm: usize,
    pub rule: usize,
    pub notification: usize,
    pub command: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            device_data: 10_000,
            alarm: 5_000,
            rule: 5_000,
            notification: 3_000,
            command: 3_000,
        }
    }
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 启动时是否自动加载状态为 RUNNING 的驱动
    pub driver_auto_start: bool,
    /// MQTT Broker 监听地址
    pub mqtt_addr: Option<String>,
    /// MQTT over WebSocket 监听地址
    pub mqtt_ws_addr: Option<String>,
    /// 客户端未声明 keep-alive 时使用的默认值（秒）
    pub mqtt_default_keep_alive_secs: u64,
    pub queue_capacities: QueueCapacities,
    pub queue_consumer_threads: usize,
    pub modbus_pool_max: usize,
    pub modbus_pool_expire_secs: u64,
    pub modbus_pool_sweep_secs: u64,
    pub s7_max_fail_count: u32,
    pub shadow_flush_ms: u64,
    pub audit_buffer_capacity: usize,
    pub northbound_mqtt_host: Option<String>,
    pub northbound_mqtt_port: u16,
    pub northbound_topic_prefix: String,
    /// 内存存储初始化数据（JSON）
    pub bootstrap_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            driver_auto_start: true,
            mqtt_addr: Some("0.0.0.0:1883".to_string()),
            mqtt_ws_addr: None,
            mqtt_default_keep_alive_secs: 60,
            queue_capacities: QueueCapacities::default(),
            queue_consumer_threads: 4,
            modbus_pool_max: 200,
            modbus_pool_expire_secs: 30 * 60,
            modbus_pool_sweep_secs: 10 * 60,
            s7_max_fail_count: 3,
            shadow_flush_ms: 1_000,
            audit_buffer_capacity: 1_000,
            northbound_mqtt_host: None,
            northbound_mqtt_port: 1883,
            northbound_topic_prefix: "gw/northbound".to_string(),
            bootstrap_file: None,
        }
    }
}

impl GatewayConfig {
    /// 从环境变量读取配置，未设置的项使用默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let driver_auto_start =
            read_bool_with_default("GW_DRIVER_AUTO_START", defaults.driver_auto_start);
        // 显式设置为空串表示不启动 MQTT Broker
        let mqtt_addr = match env::var("GW_MQTT_ADDR") {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => defaults.mqtt_addr,
        };
        let mqtt_ws_addr = read_optional("GW_MQTT_WS_ADDR");
        let mqtt_default_keep_alive_secs = read_u64_with_default(
            "GW_MQTT_DEFAULT_KEEP_ALIVE_SECS",
            defaults.mqtt_default_keep_alive_secs,
        )?;
        let queue_capacities = QueueCapacities {
            device_data: read_usize_with_default(
                "GW_QUEUE_DEVICE_DATA_CAPACITY",
                defaults.queue_capacities.device_data,
            )?,
            alarm: read_usize_with_default(
                "GW_QUEUE_ALARM_CAPACITY",
                defaults.queue_capacities.alarm,
            )?,
            rule: read_usize_with_default("GW_QUEUE_RULE_CAPACITY", defaults.queue_capacities.rule)?,
            notification: read_usize_with_default(
                "GW_QUEUE_NOTIFICATION_CAPACITY",
                defaults.queue_capacities.notification,
            )?,
            command: read_usize_with_default(
                "GW_QUEUE_COMMAND_CAPACITY",
                defaults.queue_capacities.command,
            )?,
        };
        let queue_consumer_threads =
            read_usize_with_default("GW_QUEUE_CONSUMER_THREADS", defaults.queue_consumer_threads)?;
        if queue_consumer_threads == 0 {
            return Err(ConfigError::Invalid(
                "GW_QUEUE_CONSUMER_THREADS".to_string(),
                "0".to_string(),
            ));
        }
        let modbus_pool_max =
            read_usize_with_default("GW_MODBUS_POOL_MAX", defaults.modbus_pool_max)?;
        let modbus_pool_expire_secs =
            read_u64_with_default("GW_MODBUS_POOL_EXPIRE_SECS", defaults.modbus_pool_expire_secs)?;
        let modbus_pool_sweep_secs =
            read_u64_with_default("GW_MODBUS_POOL_SWEEP_SECS", defaults.modbus_pool_sweep_secs)?;
        let s7_max_fail_count =
            read_u64_with_default("GW_S7_MAX_FAIL_COUNT", defaults.s7_max_fail_count as u64)?
                as u32;
        let shadow_flush_ms = read_u64_with_default("GW_SHADOW_FLUSH_MS", defaults.shadow_flush_ms)?;
        let audit_buffer_capacity =
            read_usize_with_default("GW_AUDIT_BUFFER_CAPACITY", defaults.audit_buffer_capacity)?;
        let northbound_mqtt_host = read_optional("GW_NORTHBOUND_MQTT_HOST");
        let northbound_mqtt_port =
            read_u16_with_default("GW_NORTHBOUND_MQTT_PORT", defaults.northbound_mqtt_port)?;
        let northbound_topic_prefix = env::var("GW_NORTHBOUND_TOPIC_PREFIX")
            .unwrap_or(defaults.northbound_topic_prefix);
        let bootstrap_file = read_optional("GW_BOOTSTRAP_FILE");

        Ok(Self {
            driver_auto_start,
            mqtt_addr,
            mqtt_ws_addr,
            mqtt_default_keep_alive_secs,
            queue_capacities,
            queue_consumer_threads,
            modbus_pool_max,
            modbus_pool_expire_secs,
            modbus_pool_sweep_secs,
            s7_max_fail_count,
            shadow_flush_ms,
            audit_buffer_capacity,
            northbound_mqtt_host,
            northbound_mqtt_port,
            northbound_topic_prefix,
            bootstrap_file,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
