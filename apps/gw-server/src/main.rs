//! 协议网关进程：装配存储、消息队列、设备消息处理、MQTT 接入与驱动管理。

use gw_config::GatewayConfig;
use gw_driver::{DriverContext, DriverManager, DriverTuning};
use gw_ingest::{
    BroadcastLivePush, DeviceDataHandler, DeviceMessageService, GatewayTopologyRouter,
    IngestConfig, IngestStores, LoggingNotifier, LoggingRuleEvaluator, MqttNorthbound,
    NoopNorthbound, NorthboundConfig, NorthboundPush, register_consumers,
};
use gw_pipeline::{MessageQueue, QueueConfig};
use gw_protocol::{
    BrokerConfig, MqttBroker, ProtocolServerManager, ServerKind, SessionManager, builtin_registry,
};
use gw_storage::{BootstrapData, InMemoryStores};
use gw_telemetry::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LIVE_PUSH_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    init_tracing();

    // 内存存储：设备、映射、拓扑、驱动配置从初始化文件装载
    let bootstrap = match &config.bootstrap_file {
        Some(path) => BootstrapData::from_file(path)?,
        None => BootstrapData::default(),
    };
    let stores = InMemoryStores::from_bootstrap(bootstrap).await?;

    let queue = MessageQueue::new(QueueConfig {
        device_data_capacity: config.queue_capacities.device_data,
        alarm_capacity: config.queue_capacities.alarm,
        rule_capacity: config.queue_capacities.rule,
        notification_capacity: config.queue_capacities.notification,
        command_capacity: config.queue_capacities.command,
        consumer_threads: config.queue_consumer_threads,
    });

    let sessions = Arc::new(SessionManager::new());
    let live = Arc::new(BroadcastLivePush::new(LIVE_PUSH_CAPACITY));
    let mut northbound_task = None;
    let northbound: Arc<dyn NorthboundPush> = match &config.northbound_mqtt_host {
        Some(host) => {
            let (client, task) = MqttNorthbound::connect(NorthboundConfig {
                host: host.clone(),
                port: config.northbound_mqtt_port,
                username: None,
                password: None,
                topic_prefix: config.northbound_topic_prefix.clone(),
            });
            northbound_task = Some(task);
            info!(target: "gw.server", host = %host, port = config.northbound_mqtt_port, "northbound_enabled");
            Arc::new(client)
        }
        None => Arc::new(NoopNorthbound),
    };

    let handler = Arc::new(DeviceDataHandler::new(
        IngestConfig {
            flush_interval: Duration::from_millis(config.shadow_flush_ms),
            audit_capacity: config.audit_buffer_capacity,
            ..IngestConfig::default()
        },
        IngestStores {
            shadows: stores.shadows.clone(),
            device_data: stores.device_data.clone(),
            time_series: stores.time_series.clone(),
        },
        queue.clone(),
        live,
        northbound,
    ));
    let router = GatewayTopologyRouter::new(
        stores.devices.clone(),
        stores.topology.clone(),
        sessions.clone(),
    );
    let service = Arc::new(DeviceMessageService::new(
        stores.devices.clone(),
        handler.clone(),
        router,
        sessions.clone(),
    ));

    register_consumers(
        &queue,
        stores.devices.clone(),
        sessions.clone(),
        Arc::new(LoggingRuleEvaluator),
        Arc::new(LoggingNotifier),
    );
    queue.start();
    handler.start();

    let broker = Arc::new(MqttBroker::new(
        sessions.clone(),
        service.clone(),
        BrokerConfig {
            default_keep_alive_secs: u16::try_from(config.mqtt_default_keep_alive_secs)
                .unwrap_or(u16::MAX),
            ..BrokerConfig::default()
        },
    ));
    let servers = ProtocolServerManager::new(broker);
    if let Some(addr) = &config.mqtt_addr {
        let addr: SocketAddr = addr.parse()?;
        servers.start("mqtt", ServerKind::MqttTcp, addr).await?;
    }
    if let Some(addr) = &config.mqtt_ws_addr {
        let addr: SocketAddr = addr.parse()?;
        servers
            .start("mqtt-ws", ServerKind::MqttWebSocket, addr)
            .await?;
    }

    let context = DriverContext::new(stores.devices.clone(), stores.mappings.clone(), service)
        .with_downlink(sessions.clone())
        .with_tuning(DriverTuning {
            modbus_pool_max: config.modbus_pool_max,
            modbus_pool_expire: Duration::from_secs(config.modbus_pool_expire_secs),
            modbus_pool_sweep: Duration::from_secs(config.modbus_pool_sweep_secs),
            s7_max_fail_count: config.s7_max_fail_count,
        });
    let drivers = DriverManager::new(
        builtin_registry(),
        context,
        stores.drivers.clone(),
        stores.driver_logs.clone(),
    )
    .with_auto_start(config.driver_auto_start);
    let started = drivers.auto_load().await;
    info!(
        target: "gw.server",
        drivers = started,
        servers = servers.running().await.len(),
        "gateway_started"
    );

    tokio::signal::ctrl_c().await?;
    info!(target: "gw.server", "shutdown_requested");

    drivers.stop_all().await;
    servers.stop_all().await;
    sessions.close_all();
    handler.shutdown().await;
    queue.shutdown().await;
    if let Some(task) = northbound_task {
        task.abort();
    }
    let status = queue.queue_status();
    if status.device_data + status.alarm + status.command > 0 {
        warn!(target: "gw.server", ?status, "queue_not_drained");
    }
    info!(target: "gw.server", "gateway_stopped");
    Ok(())
}
