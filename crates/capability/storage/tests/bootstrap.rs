use domain::DriverStatus;
use gw_storage::{BootstrapData, DeviceStore, DriverStore, InMemoryStores, MappingStore, TopoStore};

const SEED: &str = r#"{
    "devices": [
        {"id": "gw-1", "deviceKey": "gateway-01", "productKey": "gw", "productId": "gw"},
        {"id": "d-1", "deviceKey": "meter-01", "productKey": "meter", "productId": "meter", "driverId": "drv-modbus"}
    ],
    "deviceMappings": {
        "d-1": [{"identifier": "temp", "address": "100", "functionCode": "0x03", "dataType": "float", "scale": 0.1}]
    },
    "productMappings": {
        "meter": [
            {"identifier": "temp", "address": "200", "functionCode": "0x03"},
            {"identifier": "volt", "address": "201", "functionCode": "0x03"}
        ]
    },
    "topology": [{"gatewayId": "gw-1", "subDeviceId": "d-1", "bindTimeMs": 1}],
    "drivers": [
        {"driverId": "drv-modbus", "driverName": "modbus", "driverType": "MODBUS_TCP", "config": {}, "status": "RUNNING"},
        {"driverId": "drv-http", "driverName": "http", "driverType": "HTTP", "config": {"baseUrl": "http://127.0.0.1"}}
    ]
}"#;

#[tokio::test]
async fn bootstrap_populates_all_stores() {
    let data = BootstrapData::from_json(SEED).expect("seed");
    let stores = InMemoryStores::from_bootstrap(data).await.expect("stores");

    let device = stores
        .devices
        .find_by_key("meter-01")
        .await
        .expect("query")
        .expect("device");
    let mappings = stores.mappings.resolve(&device).await.expect("mappings");
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[0].address, "100");

    assert!(stores.topology.find_edge("gw-1", "d-1").await.expect("edge").is_some());

    let running = stores
        .drivers
        .list_by_status(DriverStatus::Running)
        .await
        .expect("running");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].driver_type, "MODBUS_TCP");
    assert_eq!(
        stores.drivers.get_status("drv-http").await.expect("status"),
        Some(DriverStatus::Stopped)
    );
}

#[test]
fn bootstrap_rejects_invalid_json() {
    assert!(BootstrapData::from_json("{not json").is_err());
}
