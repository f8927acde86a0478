//! Integration Tests for Voltage PLC Library
//!
//! Clients talk to virtual PLCs on loopback sockets, so every protocol is
//! exercised through both of its directions.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use voltage_plc::protocol::Inbound;
use voltage_plc::*;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Start a virtual PLC on an ephemeral port
async fn start_server(codec: Arc<dyn FrameCodec>, transport: ServerTransport) -> (DeviceServer, std::net::SocketAddr) {
    let config = DeviceServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        transport,
        units: 16_384,
        ..Default::default()
    };
    let mut server = DeviceServer::new(codec, config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// A1E read of D100 x10 returns 20 payload bytes
#[tokio::test]
async fn test_a1e_d100_scenario() {
    let codec: Arc<dyn FrameCodec> = Arc::new(A1eCodec::binary());
    let (mut server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;
    let values: Vec<u16> = (0..10).map(|i| 0x1100 + i).collect();
    server.memory().by_prefix("D").unwrap().write_words(&values, 100).unwrap();

    let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    let bytes = client.read_bytes("D100", 10).await.unwrap();
    assert_eq!(bytes.len(), 20);
    assert_eq!(&bytes[..4], &[0x00, 0x11, 0x01, 0x11]);
    assert_eq!(client.read_words("D100", 10).await.unwrap(), values);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

/// A1E ASCII framing against its own server
#[tokio::test]
async fn test_a1e_ascii_mirror() {
    let codec: Arc<dyn FrameCodec> = Arc::new(A1eCodec::ascii());
    let (server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;

    let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    client.write_words("W1F", &[0xBEEF, 0x0001]).await.unwrap();
    assert_eq!(server.memory().by_prefix("W").unwrap().read_words(0x1F, 2).unwrap(), vec![0xBEEF, 1]);

    server.memory().by_prefix("Y").unwrap().set_bool(&[true, false, true], 0o17).unwrap();
    assert_eq!(client.read_bits("Y17", 3).await.unwrap(), vec![true, false, true]);
}

/// A unit-address mismatch is rejected and leaves memory untouched
#[tokio::test]
async fn test_hostlink_station_mismatch() {
    let (server, addr) = start_server(Arc::new(HostLinkCodec::new(1)), ServerTransport::Tcp).await;

    let mut client = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(2)), TIMEOUT);
    client.connect().await.unwrap();
    let result = client.write_words("D10", &[0x1234]).await;
    assert!(result.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(server.memory().by_prefix("D").unwrap().read_words(10, 1).unwrap(), vec![0]);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.get_stats().failed_requests, 1);

    let mut matching = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(1)), TIMEOUT);
    matching.connect().await.unwrap();
    matching.write_words("D10", &[0x1234]).await.unwrap();
    assert_eq!(server.memory().by_prefix("D").unwrap().read_words(10, 1).unwrap(), vec![0x1234]);
}

/// Large requests split into ceiling-sized frames and concatenate in order
#[tokio::test]
async fn test_splitting_over_mc() {
    let codec: Arc<dyn FrameCodec> = Arc::new(McCodec::binary());
    let (server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;
    let values: Vec<u16> = (0..2000u16).collect();

    let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    client.write_words("D0", &values).await.unwrap();
    assert_eq!(client.get_stats().requests_sent, 3);

    assert_eq!(client.read_words("D0", 2000).await.unwrap(), values);
    assert_eq!(client.get_stats().requests_sent, 6);
    assert_eq!(server.memory().by_prefix("D").unwrap().read_words(1999, 1).unwrap(), vec![1999]);
}

/// Oversized writes fail before any I/O when the protocol cannot split them
#[tokio::test]
async fn test_hostlink_single_frame_writes() {
    let (_server, addr) = start_server(Arc::new(HostLinkCodec::new(0)), ServerTransport::Tcp).await;
    let mut client = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(0)), TIMEOUT);
    client.connect().await.unwrap();

    let values: Vec<u16> = (0..75).collect();
    assert_eq!(client.read_words("D0", 75).await.unwrap(), vec![0; 75]);
    let sent = client.get_stats().requests_sent;
    assert_eq!(sent, 3);

    assert_eq!(
        client.write_words("D0", &values).await.unwrap_err(),
        PlcError::length_exceeded(75, 30)
    );
    assert_eq!(client.get_stats().requests_sent, sent);
    assert_eq!(client.state(), ConnectionState::Ready);
}

/// Random bit sequences of 1..=10000 points survive a write/read cycle
#[tokio::test]
async fn test_bit_round_trip() {
    let mut rng = rand::thread_rng();
    let codecs: Vec<Arc<dyn FrameCodec>> = vec![Arc::new(McCodec::binary()), Arc::new(McCodec::ascii())];

    for codec in codecs {
        let (_server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;
        let mut client = TcpClient::tcp(addr, codec.clone(), TIMEOUT);
        client.connect().await.unwrap();

        for &count in &[1usize, 7, 8, 9, 255, 256, 3585, 7169, 10_000] {
            let bits: Vec<bool> = (0..count).map(|_| rng.gen()).collect();
            client.write_bits("M0", &bits).await.unwrap();
            assert_eq!(client.read_bits("M0", count).await.unwrap(), bits, "{} x{}", codec.name(), count);
        }
    }
}

/// Bits addressed inside word devices land on the right word bits
#[tokio::test]
async fn test_fins_tcp_handshake_and_bits() {
    let server_codec: Arc<dyn FrameCodec> = Arc::new(FinsCodec::tcp().with_local_node(10));
    let (server, addr) = start_server(server_codec, ServerTransport::Tcp).await;

    let mut client = TcpClient::tcp(addr, Arc::new(FinsCodec::tcp()), TIMEOUT);
    client.connect().await.unwrap();
    assert_eq!(client.session().local_node, 11);
    assert_eq!(client.session().remote_node, 10);

    client.write_words("D100", &[0x0102, 0x0304]).await.unwrap();
    assert_eq!(server.memory().by_prefix("DM").unwrap().read_words(100, 2).unwrap(), vec![0x0102, 0x0304]);

    client.write_bits("CIO0.14", &[true, true, true]).await.unwrap();
    assert_eq!(server.memory().by_prefix("CIO").unwrap().read_words(0, 2).unwrap(), vec![0xC000, 0x0001]);
    assert_eq!(client.read_bits("CIO0.13", 4).await.unwrap(), vec![false, true, true, true]);
}

#[tokio::test]
async fn test_fins_udp_round_trip() {
    let codec: Arc<dyn FrameCodec> = Arc::new(FinsCodec::udp());
    let (server, addr) = start_server(codec.clone(), ServerTransport::Udp).await;

    let mut client = UdpClient::udp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    client.write_words("H5", &[42]).await.unwrap();
    assert_eq!(client.read_words("H5", 1).await.unwrap(), vec![42]);
    assert_eq!(server.memory().by_prefix("HR").unwrap().read_words(5, 1).unwrap(), vec![42]);
}

/// MC over UDP reuses the TCP framing
#[tokio::test]
async fn test_mc_udp_round_trip() {
    let codec: Arc<dyn FrameCodec> = Arc::new(McCodec::binary());
    let (_server, addr) = start_server(codec.clone(), ServerTransport::Udp).await;

    let mut client = UdpClient::udp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    client.write_bool("Y1A", true).await.unwrap();
    assert!(client.read_bool("Y1A").await.unwrap());
    assert!(!client.read_bool("Y19").await.unwrap());
}

/// Fault statuses keep the session open
#[tokio::test]
async fn test_fault_status_keeps_session() {
    let codec: Arc<dyn FrameCodec> = Arc::new(McCodec::binary());
    let (server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;

    let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    let err = client.read_words("D16380", 10).await.unwrap_err();
    assert!(matches!(err, PlcError::ProtocolStatus { .. }));
    assert_eq!(client.state(), ConnectionState::Ready);

    server.set_writes_enabled(false);
    let err = client.write_words("D0", &[1]).await.unwrap_err();
    assert!(matches!(err, PlcError::ProtocolStatus { .. }));
    assert_eq!(client.read_words("D0", 1).await.unwrap(), vec![0]);

    server.set_writes_enabled(true);
    client.write_words("D0", &[1]).await.unwrap();
    assert_eq!(client.get_stats().requests_sent, 4);
    assert_eq!(server.get_stats().connections_count, 1);
}

/// Read-only devices and initial values from a YAML file
#[tokio::test]
async fn test_server_from_yaml() {
    let yaml = r#"
protocol: hostlink
bind: 127.0.0.1:0
station: 3
units: 2048
read_only: [AR]
initial:
  - address: AR10
    values: [85, 170]
"#;
    let mut server = ServerConfig::from_yaml(yaml).unwrap().build_server().unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(3)), TIMEOUT);
    client.connect().await.unwrap();
    assert_eq!(client.read_words("AR10", 2).await.unwrap(), vec![85, 170]);
    assert!(matches!(
        client.write_words("AR10", &[0]).await,
        Err(PlcError::ProtocolStatus { .. })
    ));
    client.write_words("LR10", &[7]).await.unwrap();
}

/// A3C replies prefixed with line noise are still recognised
#[tokio::test]
async fn test_a3c_noise_before_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let codec = A3cCodec::new(0);
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let mut session = SessionContext::default();
        let request = match codec.decode_inbound(&buf[..n], &mut session).unwrap() {
            Inbound::Command(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        let payload = DataPayload::Bytes(vec![0x34, 0x12, 0x78, 0x56]);
        let reply = codec.encode_reply(&request, 0, Some(&payload), &session).unwrap();
        stream.write_all(&[0x00, 0xFF, b'x']).await.unwrap();
        stream.write_all(&reply).await.unwrap();
        sleep(Duration::from_millis(200)).await;
    });

    let mut client = TcpClient::tcp(addr, Arc::new(A3cCodec::new(0)), TIMEOUT);
    client.connect().await.unwrap();
    assert_eq!(client.read_words("D0", 2).await.unwrap(), vec![0x1234, 0x5678]);
}

/// A silent peer produces a typed timeout and drops the connection; nothing
/// is sent again until the caller reconnects
#[tokio::test]
async fn test_timeout_disconnects_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // the first connection is swallowed, the second one is answered
        let (mut silent, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = silent.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let codec = HostLinkCodec::new(0);
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let mut session = SessionContext::default();
        let request = match codec.decode_inbound(&buf[..n], &mut session).unwrap() {
            Inbound::Command(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        let payload = DataPayload::Bytes(vec![0x00, 0x2A]);
        let reply = codec.encode_reply(&request, 0, Some(&payload), &session).unwrap();
        stream.write_all(&reply).await.unwrap();
        sleep(Duration::from_millis(200)).await;
    });

    let mut client = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(0)), Duration::from_millis(100));
    client.connect().await.unwrap();
    let err = client.read_words("D0", 1).await.unwrap_err();
    assert!(matches!(err, PlcError::Timeout { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.get_stats().requests_sent, 1);

    assert!(matches!(client.read_words("D0", 1).await, Err(PlcError::Connection { .. })));
    assert_eq!(client.get_stats().requests_sent, 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    assert_eq!(client.read_words("D0", 1).await.unwrap(), vec![42]);
    assert_eq!(client.get_stats().requests_sent, 2);
}

/// Connections outside the allow list are closed before any frame is read
#[tokio::test]
async fn test_session_gate_rejects_peer() {
    let config = DeviceServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        units: 1024,
        ..Default::default()
    };
    let codec: Arc<dyn FrameCodec> = Arc::new(A1eCodec::binary());
    let mut server = DeviceServer::new(codec.clone(), config)
        .with_gate(Arc::new(AllowList::new(vec!["10.1.2.3".parse().unwrap()])));
    let addr = server.start().await.unwrap();

    let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
    client.connect().await.unwrap();
    assert!(client.read_words("D0", 1).await.is_err());
    assert_eq!(server.get_stats().rejected_connections, 1);
    assert_eq!(server.get_stats().total_requests, 0);
}

/// Independent sessions share one memory bank
#[tokio::test]
async fn test_concurrent_clients() {
    let codec: Arc<dyn FrameCodec> = Arc::new(McCodec::binary());
    let (server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;

    let tasks = (0..5u16).map(|i| {
        let codec = codec.clone();
        async move {
            let mut client = TcpClient::tcp(addr, codec, TIMEOUT);
            client.connect().await?;
            let address = format!("D{}", i * 100);
            let values: Vec<u16> = (0..50).map(|v| v + i * 1000).collect();
            client.write_words(&address, &values).await?;
            let back = client.read_words(&address, 50).await?;
            client.close().await?;
            Ok::<bool, PlcError>(back == values)
        }
    });
    for result in join_all(tasks).await {
        assert!(result.unwrap());
    }

    assert_eq!(server.memory().by_prefix("D").unwrap().read_words(400, 1).unwrap(), vec![4000]);
    assert_eq!(server.get_stats().connections_count, 5);
}

/// The blocking client drives the same engine from a plain thread
#[test]
fn test_blocking_client_against_server() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let codec: Arc<dyn FrameCodec> = Arc::new(McCodec::ascii());
    let (server, addr) = runtime.block_on(start_server(codec.clone(), ServerTransport::Tcp));

    let mut client = BlockingClient::new(StdTcpTransport::new(addr, TIMEOUT), codec);
    client.connect().unwrap();
    client.write_words("D200", &[1, 2, 3]).unwrap();
    assert_eq!(client.read_words("D200", 3).unwrap(), vec![1, 2, 3]);
    client.write_bool("X1F", true).unwrap();
    assert_eq!(client.read_bits("X1E", 2).unwrap(), vec![false, true]);
    assert_eq!(client.metrics().successful_requests, 4);
    client.close().unwrap();

    assert_eq!(server.memory().by_prefix("D").unwrap().read_words(200, 3).unwrap(), vec![1, 2, 3]);
    drop(server);
    runtime.shutdown_timeout(Duration::from_millis(100));
}

/// Packet logging sees every frame in both directions
#[tokio::test]
async fn test_packet_logging_callback() {
    let codec: Arc<dyn FrameCodec> = Arc::new(A1eCodec::binary());
    let (_server, addr) = start_server(codec.clone(), ServerTransport::Tcp).await;

    let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback: LogCallback = Box::new(move |_, message| sink.lock().unwrap().push(message.to_string()));
    let logger = PacketLogger::new(Some(callback), LogLevel::Info);

    let mut client = TransactionClient::with_logger(TcpTransport::new(addr, TIMEOUT), codec, logger);
    client.connect().await.unwrap();
    client.read_words("D0", 1).await.unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.starts_with("send (12 bytes): 01 FF 0A 00")));
    assert!(lines.iter().any(|l| l.contains("A1E receive")));
}
