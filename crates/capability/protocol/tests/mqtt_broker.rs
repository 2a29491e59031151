use async_trait::async_trait;
use domain::{DataMap, Device};
use futures_util::{SinkExt, StreamExt};
use gw_driver::DeviceMessageSink;
use gw_protocol::mqtt::{Connect, MqttCodec, Packet, Publish, connack};
use gw_protocol::{BrokerConfig, MqttBroker, SessionManager};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Online(String),
    Offline(String),
    Message(String, Vec<u8>),
}

/// 只接受 secret-{clientId} 作为密码。
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl DeviceMessageSink for RecordingSink {
    async fn authenticate(&self, client_id: &str, _username: &str, password: &str) -> bool {
        password == format!("secret-{client_id}")
    }

    async fn device_online(&self, device_key: &str, _ip_address: Option<&str>) {
        self.push(Event::Online(device_key.to_string()));
    }

    async fn device_offline(&self, device_key: &str) {
        self.push(Event::Offline(device_key.to_string()));
    }

    async fn handle_device_message(&self, topic: &str, payload: &[u8]) {
        self.push(Event::Message(topic.to_string(), payload.to_vec()));
    }

    async fn report_property(&self, _device: &Device, _data: DataMap) {}

    async fn report_event(&self, _device: &Device, _data: DataMap) {}
}

async fn start_broker() -> (SocketAddr, Arc<RecordingSink>, Arc<SessionManager>) {
    let sink = Arc::new(RecordingSink::default());
    let sessions = Arc::new(SessionManager::new());
    let broker = Arc::new(MqttBroker::new(
        Arc::clone(&sessions),
        sink.clone(),
        BrokerConfig::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(broker.serve(listener));
    (addr, sink, sessions)
}

async fn connect(addr: SocketAddr, packet: Connect) -> (Framed<TcpStream, MqttCodec>, Packet) {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut framed = Framed::new(stream, MqttCodec::new(1024 * 1024));
    framed.send(Packet::Connect(packet)).await.expect("send connect");
    let reply = next_packet(&mut framed).await.expect("connack");
    (framed, reply)
}

async fn next_packet(framed: &mut Framed<TcpStream, MqttCodec>) -> Option<Packet> {
    match timeout(Duration::from_secs(5), framed.next()).await {
        Ok(Some(Ok(packet))) => Some(packet),
        _ => None,
    }
}

async fn wait_for(sink: &RecordingSink, expected: &Event) {
    for _ in 0..100 {
        if sink.events().contains(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("event not observed: {expected:?}, got {:?}", sink.events());
}

#[tokio::test]
async fn accepted_device_publishes_into_the_sink() {
    let (addr, sink, sessions) = start_broker().await;
    let (mut client, reply) =
        connect(addr, Connect::new("meter-01").with_credentials("meter-01", "secret-meter-01")).await;
    assert_eq!(
        reply,
        Packet::ConnAck {
            session_present: false,
            return_code: connack::ACCEPTED
        }
    );
    wait_for(&sink, &Event::Online("meter-01".to_string())).await;
    assert!(sessions.is_online("meter-01"));

    let topic = "/sys/pk-1/meter-01/thing/event/property/post";
    client
        .send(Packet::Publish(Publish::new(topic, 1, Some(7), &b"{\"temp\":21.5}"[..])))
        .await
        .expect("publish");
    assert_eq!(next_packet(&mut client).await, Some(Packet::PubAck(7)));
    wait_for(
        &sink,
        &Event::Message(topic.to_string(), b"{\"temp\":21.5}".to_vec()),
    )
    .await;

    client.send(Packet::PingReq).await.expect("ping");
    assert_eq!(next_packet(&mut client).await, Some(Packet::PingResp));

    client.send(Packet::Disconnect).await.expect("disconnect");
    wait_for(&sink, &Event::Offline("meter-01".to_string())).await;
    assert!(!sessions.is_online("meter-01"));
}

#[tokio::test]
async fn wrong_password_is_refused_with_code_4() {
    let (addr, sink, sessions) = start_broker().await;
    let (mut client, reply) =
        connect(addr, Connect::new("meter-02").with_credentials("meter-02", "nope")).await;
    assert_eq!(
        reply,
        Packet::ConnAck {
            session_present: false,
            return_code: connack::BAD_USERNAME_OR_PASSWORD
        }
    );
    assert_eq!(next_packet(&mut client).await, None);
    assert!(!sessions.is_online("meter-02"));
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn unsupported_protocol_level_is_refused_with_code_1() {
    let (addr, _sink, _sessions) = start_broker().await;
    let mut packet = Connect::new("meter-03").with_credentials("meter-03", "secret-meter-03");
    packet.protocol_level = 5;
    let (_client, reply) = connect(addr, packet).await;
    assert_eq!(
        reply,
        Packet::ConnAck {
            session_present: false,
            return_code: connack::UNACCEPTABLE_PROTOCOL_VERSION
        }
    );
}

#[tokio::test]
async fn second_connection_takes_over_the_session() {
    let (addr, sink, sessions) = start_broker().await;
    let credentials = || Connect::new("meter-04").with_credentials("meter-04", "secret-meter-04");
    let (mut first, _) = connect(addr, credentials()).await;
    wait_for(&sink, &Event::Online("meter-04".to_string())).await;

    let (mut second, reply) = connect(addr, credentials()).await;
    assert!(matches!(
        reply,
        Packet::ConnAck {
            return_code: connack::ACCEPTED,
            ..
        }
    ));
    // 旧连接被服务端关闭
    assert_eq!(next_packet(&mut first).await, None);
    assert!(sessions.is_online("meter-04"));

    second.send(Packet::PingReq).await.expect("ping");
    assert_eq!(next_packet(&mut second).await, Some(Packet::PingResp));
    // 被接管的连接不触发离线
    assert!(!sink.events().contains(&Event::Offline("meter-04".to_string())));
}

#[tokio::test]
async fn server_push_reaches_the_device() {
    let (addr, sink, sessions) = start_broker().await;
    let (mut client, _) =
        connect(addr, Connect::new("meter-05").with_credentials("meter-05", "secret-meter-05")).await;
    wait_for(&sink, &Event::Online("meter-05".to_string())).await;

    assert!(sessions.publish("meter-05", "/sys/pk-1/meter-05/thing/service/invoke", b"{}"));
    match next_packet(&mut client).await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.topic, "/sys/pk-1/meter-05/thing/service/invoke");
            assert_eq!(publish.qos, 1);
            assert!(publish.packet_id.is_some());
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
    assert!(!sessions.publish("nobody", "/x", b"{}"));
}
