use domain::{DataType, Device, DeviceStatus, DriverConfig, PropertyMapping};

#[test]
fn device_parses_from_camel_case_json() {
    let json = r#"{
        "id": "d-1",
        "deviceKey": "meter-01",
        "deviceSecret": "s3cret",
        "productKey": "meter",
        "driverId": "drv-modbus",
        "status": "OFFLINE",
        "driverConfig": {"host": "10.0.0.5", "port": 502, "slaveAddress": 2}
    }"#;
    let device: Device = serde_json::from_str(json).expect("device");
    assert_eq!(device.device_key, "meter-01");
    assert_eq!(device.status, DeviceStatus::Offline);
    assert_eq!(device.driver_id.as_deref(), Some("drv-modbus"));
    assert_eq!(device.config_str("host"), Some("10.0.0.5"));
    assert_eq!(device.config_i64("slaveAddress"), Some(2));
}

#[test]
fn mapping_parses_aliases() {
    let json = r#"[
        {"identifier": "power", "address": "DB1.DBD4", "dataType": "real"},
        {"identifier": "temp", "address": "100", "functionCode": "0x03", "dataType": "float", "scale": 0.1}
    ]"#;
    let mappings: Vec<PropertyMapping> = serde_json::from_str(json).expect("mappings");
    assert_eq!(mappings[0].data_type, DataType::Float);
    assert_eq!(mappings[1].function_code_value(), Some(3));
    assert_eq!(mappings[1].scale, Some(0.1));
}

#[test]
fn driver_config_parses() {
    let json = r#"{"driverId": "drv-1", "driverName": "S7 line", "driverType": "S7", "config": {"pollingInterval": 2000}}"#;
    let config: DriverConfig = serde_json::from_str(json).expect("config");
    assert_eq!(config.driver_type, "S7");
    assert_eq!(config.get_u64_or("pollingInterval", 5000), 2000);
}
