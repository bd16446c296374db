// End-to-end transfers between a real server task and clients on loopback.

use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tempdir::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use udp_tftp::config::{ReceiveTimeouts, SendTimeouts};
use udp_tftp::tftp::{ErrorCode, Packet, TftpSocket};
use udp_tftp::{Client, ClientConfig, Operation, Server, ServerConfig, SessionReport, TransferError, TransferSummary};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_server(root: &Path) -> (SocketAddr, mpsc::UnboundedReceiver<SessionReport>) {
    init_logging();
    let server = Server::bind(ServerConfig {
        bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        root: root.to_path_buf(),
        read: SendTimeouts { ack: Duration::from_millis(200), max_timeouts: 5 },
        write: ReceiveTimeouts {
            data: Duration::from_millis(800),
            drain: Duration::from_millis(100),
        },
    })
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(server.serve(tx));
    (addr, rx)
}

fn client_for(server_addr: SocketAddr) -> Client {
    Client::new(ClientConfig {
        server_addr,
        read: ReceiveTimeouts {
            data: Duration::from_millis(400),
            drain: Duration::from_millis(100),
        },
        write: SendTimeouts { ack: Duration::from_millis(200), max_timeouts: 4 },
    })
}

fn raw_client() -> TftpSocket {
    TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<SessionReport>) -> SessionReport {
    tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("no session report")
        .expect("server stopped")
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[tokio::test]
async fn get_empty_file() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    tokio::fs::write(root.path().join("empty.bin"), b"").await.unwrap();
    let (addr, mut reports) = start_server(root.path());

    let out = local.path().join("empty.bin");
    let summary = assert_ok!(client_for(addr).get(&out, "empty.bin").await);
    assert_eq!(summary, TransferSummary { bytes: 0, blocks: 1 });
    assert_eq!(tokio::fs::read(&out).await.unwrap(), Vec::<u8>::new());

    let report = next_report(&mut reports).await;
    assert_eq!(report.operation, Operation::Get);
    assert_eq!(report.filename, "empty.bin");
    assert_eq!(report.result.unwrap(), TransferSummary { bytes: 0, blocks: 1 });
}

#[tokio::test]
async fn put_600_bytes() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let contents = random_bytes(600);
    let src = local.path().join("upload.bin");
    tokio::fs::write(&src, &contents).await.unwrap();
    let (addr, mut reports) = start_server(root.path());

    let summary = assert_ok!(client_for(addr).put(&src, "upload.bin").await);
    assert_eq!(summary, TransferSummary { bytes: 600, blocks: 2 });

    let report = next_report(&mut reports).await;
    assert_eq!(report.operation, Operation::Put);
    assert_eq!(report.result.unwrap(), TransferSummary { bytes: 600, blocks: 2 });
    assert_eq!(tokio::fs::read(root.path().join("upload.bin")).await.unwrap(), contents);
}

#[tokio::test]
async fn put_600_bytes_packet_by_packet() {
    let root = TempDir::new("root").unwrap();
    let (addr, mut reports) = start_server(root.path());
    let client = raw_client();
    let wait = Duration::from_secs(2);

    client.send(&Packet::WriteReq { path: "upload.bin".to_string() }, addr).await.unwrap();
    let (ack, data_addr) = client.recv_with_timeout(wait).await.unwrap();
    assert_eq!(ack, Packet::Ack { block: 0 });
    assert_ne!(data_addr, addr);

    client.send(&Packet::Data { block: 1, data: vec![1; 512] }, data_addr).await.unwrap();
    assert_eq!(client.recv_with_timeout(wait).await.unwrap().0, Packet::Ack { block: 1 });
    client.send(&Packet::Data { block: 2, data: vec![2; 88] }, data_addr).await.unwrap();
    assert_eq!(client.recv_with_timeout(wait).await.unwrap().0, Packet::Ack { block: 2 });

    // The file only appears once the server has stopped hearing from us.
    let report = next_report(&mut reports).await;
    assert_eq!(report.peer, client.local_addr().unwrap());
    assert_eq!(report.result.unwrap(), TransferSummary { bytes: 600, blocks: 2 });

    let mut expected = vec![1; 512];
    expected.extend_from_slice(&[2; 88]);
    assert_eq!(tokio::fs::read(root.path().join("upload.bin")).await.unwrap(), expected);
}

#[tokio::test]
async fn unknown_opcode_is_ignored() {
    let root = TempDir::new("root").unwrap();
    tokio::fs::write(root.path().join("after.txt"), b"still serving").await.unwrap();
    let (addr, mut reports) = start_server(root.path());

    let raw = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    raw.send_to(&[99, 0, b'x', 0, b'o', b'c', b't', b'e', b't', 0], addr).await.unwrap();

    let mut buf = [0; 1024];
    assert!(tokio::time::timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await.is_err());
    assert!(reports.try_recv().is_err());

    let local = TempDir::new("local").unwrap();
    let out = local.path().join("after.txt");
    assert_ok!(client_for(addr).get(&out, "after.txt").await);
    assert_eq!(tokio::fs::read(&out).await.unwrap(), b"still serving".to_vec());
}

#[tokio::test]
async fn get_exact_multiple_of_block_size() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let contents = random_bytes(1024);
    tokio::fs::write(root.path().join("two_blocks.bin"), &contents).await.unwrap();
    let (addr, _reports) = start_server(root.path());

    let out = local.path().join("two_blocks.bin");
    let summary = assert_ok!(client_for(addr).get(&out, "two_blocks.bin").await);
    // Two full blocks and the empty one that ends the transfer.
    assert_eq!(summary, TransferSummary { bytes: 1024, blocks: 3 });
    assert_eq!(tokio::fs::read(&out).await.unwrap(), contents);
}

#[tokio::test]
async fn get_large_file() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let contents = random_bytes(200 * 512 + 17);
    tokio::fs::write(root.path().join("large.bin"), &contents).await.unwrap();
    let (addr, _reports) = start_server(root.path());

    let out = local.path().join("large.bin");
    let summary = assert_ok!(client_for(addr).get(&out, "/large.bin").await);
    assert_eq!(summary, TransferSummary { bytes: contents.len() as u64, blocks: 201 });
    assert_eq!(tokio::fs::read(&out).await.unwrap(), contents);
}

#[tokio::test]
async fn get_missing_file_times_out() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let (addr, mut reports) = start_server(root.path());

    let out = local.path().join("missing.bin");
    let res = client_for(addr).get(&out, "missing.bin").await;
    assert!(matches!(res, Err(TransferError::TimedOut { block: 1 })));
    assert!(!out.exists());

    let report = next_report(&mut reports).await;
    assert_eq!(report.filename, "missing.bin");
    assert!(matches!(report.result, Err(TransferError::File(_))));
}

#[tokio::test]
async fn concurrent_sessions() {
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let first = random_bytes(3000);
    let second = random_bytes(5000);
    tokio::fs::write(root.path().join("first.bin"), &first).await.unwrap();
    tokio::fs::write(root.path().join("second.bin"), &second).await.unwrap();
    let (addr, mut reports) = start_server(root.path());

    let out_first = local.path().join("first.bin");
    let out_second = local.path().join("second.bin");
    let client = client_for(addr);
    let (a, b) = tokio::join!(client.get(&out_first, "first.bin"), client.get(&out_second, "second.bin"));
    assert_ok!(a);
    assert_ok!(b);

    assert_eq!(tokio::fs::read(&out_first).await.unwrap(), first);
    assert_eq!(tokio::fs::read(&out_second).await.unwrap(), second);

    let mut names = vec![next_report(&mut reports).await.filename, next_report(&mut reports).await.filename];
    names.sort();
    assert_eq!(names, vec!["first.bin".to_string(), "second.bin".to_string()]);
}

#[tokio::test]
async fn stray_source_does_not_disturb_session() {
    let root = TempDir::new("root").unwrap();
    tokio::fs::write(root.path().join("file.bin"), vec![5; 700]).await.unwrap();
    let (addr, mut reports) = start_server(root.path());
    let client = raw_client();
    let stray = raw_client();
    let wait = Duration::from_secs(2);

    client.send(&Packet::ReadReq { path: "file.bin".to_string() }, addr).await.unwrap();
    let (first, data_addr) = client.recv_with_timeout(wait).await.unwrap();
    assert_eq!(first, Packet::Data { block: 1, data: vec![5; 512] });

    stray.send(&Packet::Ack { block: 1 }, data_addr).await.unwrap();
    assert_eq!(stray.recv_with_timeout(wait).await.unwrap().0, Packet::error(ErrorCode::UnknownTid));

    client.send(&Packet::Ack { block: 1 }, data_addr).await.unwrap();
    let (second, _) = client.recv_with_timeout(wait).await.unwrap();
    assert_eq!(second, Packet::Data { block: 2, data: vec![5; 188] });
    client.send(&Packet::Ack { block: 2 }, data_addr).await.unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.result.unwrap(), TransferSummary { bytes: 700, blocks: 2 });
}

#[tokio::test]
async fn stray_garbage_does_not_disturb_session() {
    let root = TempDir::new("root").unwrap();
    tokio::fs::write(root.path().join("file.bin"), vec![6; 600]).await.unwrap();
    let (addr, mut reports) = start_server(root.path());
    let client = raw_client();
    let wait = Duration::from_secs(2);

    client.send(&Packet::ReadReq { path: "file.bin".to_string() }, addr).await.unwrap();
    let (first, data_addr) = client.recv_with_timeout(wait).await.unwrap();
    assert_eq!(first, Packet::Data { block: 1, data: vec![6; 512] });

    let raw = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    raw.send_to(&[0x63, 0x00, 0x00, 0x00], data_addr).await.unwrap();
    let mut buf = [0; 1024];
    let (n, _) = tokio::time::timeout(wait, raw.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(Packet::parse_from_buf(&buf[..n]).unwrap(), Packet::error(ErrorCode::UnknownTid));

    client.send(&Packet::Ack { block: 1 }, data_addr).await.unwrap();
    let (second, _) = client.recv_with_timeout(wait).await.unwrap();
    assert_eq!(second, Packet::Data { block: 2, data: vec![6; 88] });
    client.send(&Packet::Ack { block: 2 }, data_addr).await.unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.result.unwrap(), TransferSummary { bytes: 600, blocks: 2 });
}
