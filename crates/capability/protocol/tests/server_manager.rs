use gw_driver::NoopMessageSink;
use gw_protocol::{BrokerConfig, MqttBroker, ProtocolServerManager, ServerKind, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

fn manager() -> ProtocolServerManager {
    let broker = MqttBroker::new(
        Arc::new(SessionManager::new()),
        Arc::new(NoopMessageSink),
        BrokerConfig::default(),
    );
    ProtocolServerManager::new(Arc::new(broker))
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn start_reports_bound_address_and_accepts_connections() {
    let manager = manager();
    let addr = manager
        .start("mqtt-tcp", ServerKind::MqttTcp, loopback(0))
        .await
        .expect("start");
    assert_ne!(addr.port(), 0);
    TcpStream::connect(addr).await.expect("connect");

    let info = manager.info("mqtt-tcp").await.expect("info");
    assert_eq!(info.kind, ServerKind::MqttTcp);
    assert_eq!(info.local_addr, addr);
    manager.stop_all().await;
    assert!(manager.running().await.is_empty());
}

#[tokio::test]
async fn duplicate_id_and_port_are_rejected() {
    let manager = manager();
    let addr = manager
        .start("a", ServerKind::MqttTcp, loopback(0))
        .await
        .expect("start");
    assert!(manager.start("a", ServerKind::MqttTcp, loopback(0)).await.is_err());
    assert!(
        manager
            .start("b", ServerKind::MqttWebSocket, loopback(addr.port()))
            .await
            .is_err()
    );
    let ws = manager
        .start("b", ServerKind::MqttWebSocket, loopback(0))
        .await
        .expect("ws start");
    assert_ne!(ws.port(), addr.port());

    let ids: Vec<String> = manager.running().await.into_iter().map(|info| info.id).collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    manager.stop_all().await;
}

#[tokio::test]
async fn restart_keeps_the_port_and_stop_is_idempotent() {
    let manager = manager();
    let first = manager
        .start("mqtt", ServerKind::MqttTcp, loopback(0))
        .await
        .expect("start");
    let second = manager.restart("mqtt").await.expect("restart");
    assert_eq!(first.port(), second.port());
    TcpStream::connect(second).await.expect("connect after restart");

    assert!(manager.stop("mqtt").await);
    assert!(!manager.stop("mqtt").await);
    assert!(manager.restart("mqtt").await.is_err());
}
