use gw_protocol::s7::frame;
use gw_protocol::s7::{S7Address, S7Client, S7Endpoint};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_tpkt(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.expect("tpkt header");
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let mut frame = header.to_vec();
    frame.resize(len, 0);
    stream.read_exact(&mut frame[4..]).await.expect("tpkt body");
    frame
}

fn padded(len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[0] = 0x03;
    frame[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    frame
}

/// 仿真 PLC：完成握手后逐个应答请求，返回收到的请求帧。
async fn fake_plc(listener: TcpListener, replies: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let cr = read_tpkt(&mut stream).await;
    assert_eq!(cr.len(), 22);
    stream.write_all(&padded(22)).await.expect("cotp confirm");
    let setup = read_tpkt(&mut stream).await;
    assert_eq!(setup.len(), 25);
    stream.write_all(&padded(27)).await.expect("setup response");

    let mut requests = Vec::new();
    for reply in replies {
        requests.push(read_tpkt(&mut stream).await);
        stream.write_all(&reply).await.expect("reply");
    }
    requests
}

fn endpoint(port: u16) -> S7Endpoint {
    S7Endpoint {
        host: "127.0.0.1".to_string(),
        port,
        rack: 0,
        slot: 1,
        skip_handshake: false,
    }
}

#[tokio::test]
async fn reads_a_db_word_over_iso_on_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let plc = tokio::spawn(fake_plc(listener, vec![frame::read_response(&[0x01, 0x2C])]));

    let client = S7Client::new(Duration::from_secs(2));
    client.connect("plc-1", &endpoint(port)).await.expect("connect");
    assert!(client.is_connected("plc-1").await);

    let address: S7Address = "DB1.DBW100".parse().expect("address");
    let data = client.read_address("plc-1", &address, 2).await.expect("read");
    assert_eq!(data, vec![0x01, 0x2C]);

    let requests = plc.await.expect("plc task");
    let request = &requests[0];
    assert_eq!(request.len(), 31);
    // 读变量功能码，DB 区，块号 1，位地址 800
    assert_eq!(request[17], 0x04);
    assert_eq!(&request[25..27], &[0x00, 0x01]);
    assert_eq!(request[27], 0x84);
    assert_eq!(&request[28..31], &[0x00, 0x03, 0x20]);
}

#[tokio::test]
async fn write_reports_plc_return_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let mut accepted = padded(22);
    accepted[21] = 0xFF;
    let rejected = padded(22);
    let plc = tokio::spawn(fake_plc(listener, vec![accepted, rejected]));

    let client = S7Client::new(Duration::from_secs(2));
    client.connect("plc-2", &endpoint(port)).await.expect("connect");
    assert!(client.write_db("plc-2", 1, 10, &[0x00, 0x2A]).await.expect("write"));
    assert!(!client.write_db("plc-2", 1, 10, &[0x00, 0x2B]).await.expect("write"));

    let requests = plc.await.expect("plc task");
    assert_eq!(requests[0].len(), 37);
    assert_eq!(&requests[0][35..], &[0x00, 0x2A]);
}

#[tokio::test]
async fn connect_failure_leaves_device_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let client = S7Client::new(Duration::from_millis(500));
    assert!(client.connect("plc-3", &endpoint(port)).await.is_err());
    assert!(!client.is_connected("plc-3").await);
    assert!(client.read_db("plc-3", 1, 0, 2).await.is_err());
}
