use gw_config::GatewayConfig;

// 环境变量是进程级共享状态，全部断言放在同一个测试里。
#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("GW_DRIVER_AUTO_START", "off");
        std::env::set_var("GW_MQTT_ADDR", "127.0.0.1:11883");
        std::env::set_var("GW_QUEUE_ALARM_CAPACITY", "16");
        std::env::set_var("GW_MODBUS_POOL_MAX", "8");
    }

    let config = GatewayConfig::from_env().expect("config");
    assert!(!config.driver_auto_start);
    assert_eq!(config.mqtt_addr.as_deref(), Some("127.0.0.1:11883"));
    assert_eq!(config.queue_capacities.alarm, 16);
    assert_eq!(config.queue_capacities.device_data, 10_000);
    assert_eq!(config.modbus_pool_max, 8);
    assert_eq!(config.s7_max_fail_count, 3);

    unsafe {
        std::env::set_var("GW_QUEUE_CONSUMER_THREADS", "many");
    }
    assert!(GatewayConfig::from_env().is_err());

    unsafe {
        std::env::set_var("GW_QUEUE_CONSUMER_THREADS", "2");
        std::env::set_var("GW_MQTT_ADDR", "");
    }
    let config = GatewayConfig::from_env().expect("config");
    assert!(config.mqtt_addr.is_none());
    assert_eq!(config.queue_consumer_threads, 2);
}
