//! End-to-end tests over loopback sockets: a real agent, a scripted peer.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use scanbridge_agent::agent::Agent;
use scanbridge_agent::config::Config;
use scanbridge_agent::netif::InterfaceInfo;
use scanbridge_agent::store::StoredArtifact;
use scanbridge_core::{wire, ControlMessage, RequestKind, MESSAGE_LEN};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

fn test_config(dir: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.network.udp_port = 0;
    cfg.network.tcp_port = 0;
    cfg.network.tcp_connection_timeout = 2.0;
    cfg.network.shutdown_grace = 1.0;
    cfg.scanner.default_src_name = "AgentA".to_string();
    cfg.scanner.files_directory = dir.path().to_path_buf();
    cfg
}

async fn start_agent(cfg: Config) -> Agent {
    Agent::start(cfg, InterfaceInfo::loopback()).await.unwrap()
}

/// The agent binds the wildcard address; talk to it over loopback.
fn on_loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
}

fn discovery_from(name: &str) -> [u8; MESSAGE_LEN] {
    wire::encode(&ControlMessage::new(
        RequestKind::Discovery,
        Ipv4Addr::LOCALHOST,
        name,
        "",
    ))
}

fn transfer_request_from(name: &str) -> [u8; MESSAGE_LEN] {
    wire::encode(&ControlMessage::new(
        RequestKind::Transfer,
        Ipv4Addr::LOCALHOST,
        name,
        "AgentA",
    ))
}

async fn recv_reply(socket: &UdpSocket) -> ControlMessage {
    let mut buf = [0u8; 256];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no reply within timeout")
        .unwrap();
    assert_eq!(n, MESSAGE_LEN);
    wire::decode(&buf[..n]).unwrap()
}

/// Poll the store until it holds `count` artifacts.
async fn wait_for_artifacts(agent: &Agent, count: usize) -> Vec<StoredArtifact> {
    for _ in 0..100 {
        let artifacts = agent.store().list_artifacts().await;
        if artifacts.len() == count {
            return artifacts;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("store never reached {} artifacts", count);
}

/// One complete transfer: announce over UDP, wait for the ack, stream the
/// payload over TCP.
async fn run_transfer(agent: &Agent, payload: &[u8]) {
    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    control
        .send_to(&transfer_request_from("Scanner1"), on_loopback(agent.udp_addr()))
        .await
        .unwrap();
    let ack = recv_reply(&control).await;
    assert_eq!(ack.request, RequestKind::Transfer);

    let mut data = TcpStream::connect(on_loopback(agent.tcp_addr()))
        .await
        .unwrap();
    data.write_all(payload).await.unwrap();
    data.shutdown().await.unwrap();
}

#[tokio::test]
async fn discovery_roundtrip() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&discovery_from("Scanner1"), on_loopback(agent.udp_addr()))
        .await
        .unwrap();

    let reply = recv_reply(&socket).await;
    assert_eq!(reply.request, RequestKind::Discovery);
    assert_eq!(reply.initiator_ip, Ipv4Addr::LOCALHOST);
    assert_eq!(reply.src_name, "AgentA");
    assert_eq!(reply.dst_name, "Scanner1");

    agent.shutdown().await;
}

#[tokio::test]
async fn transfer_happy_path() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;

    run_transfer(&agent, b"HELLOWORLD").await;

    let artifacts = wait_for_artifacts(&agent, 1).await;
    assert_eq!(artifacts[0].size, 10);
    assert_eq!(artifacts[0].sender_ip, Ipv4Addr::LOCALHOST);
    let contents = tokio::fs::read(&artifacts[0].path).await.unwrap();
    assert_eq!(contents, b"HELLOWORLD");
    let name = artifacts[0].path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("received_file_"));
    assert!(name.ends_with("_127_0_0_1.raw"));

    agent.shutdown().await;
}

#[tokio::test]
async fn malformed_datagram_is_ignored() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;
    let target = on_loopback(agent.udp_addr());

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&[0xAAu8; 50], target).await.unwrap();

    // No response to garbage.
    let mut buf = [0u8; 256];
    let silent = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(silent.is_err());

    // Still answers a valid discovery afterwards.
    socket
        .send_to(&discovery_from("Scanner1"), target)
        .await
        .unwrap();
    let reply = recv_reply(&socket).await;
    assert_eq!(reply.src_name, "AgentA");

    agent.shutdown().await;
}

#[tokio::test]
async fn unannounced_connection_still_stores_payload() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;

    // Straight to the data port, no transfer request first.
    let mut data = TcpStream::connect(on_loopback(agent.tcp_addr()))
        .await
        .unwrap();
    data.write_all(b"orphan").await.unwrap();
    data.shutdown().await.unwrap();

    let artifacts = wait_for_artifacts(&agent, 1).await;
    let contents = tokio::fs::read(&artifacts[0].path).await.unwrap();
    assert_eq!(contents, b"orphan");

    agent.shutdown().await;
}

#[tokio::test]
async fn empty_transfer_commits_empty_artifact() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;

    run_transfer(&agent, b"").await;

    let artifacts = wait_for_artifacts(&agent, 1).await;
    assert_eq!(artifacts[0].size, 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn retention_keeps_only_newest() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.scanner.max_files_retention = 3;
    let agent = start_agent(cfg).await;

    run_transfer(&agent, b"first").await;
    let first = wait_for_artifacts(&agent, 1).await.remove(0);

    // Spread commits across distinct one-second timestamps.
    for payload in [&b"second"[..], b"third", b"fourth"] {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        run_transfer(&agent, payload).await;
    }

    // The fourth commit pushes the store past the bound and evicts the
    // oldest artifact.
    let mut artifacts = Vec::new();
    for _ in 0..100 {
        artifacts = agent.store().list_artifacts().await;
        if artifacts.iter().all(|a| a.path != first.path) && artifacts.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(artifacts.len(), 3);
    assert!(artifacts.iter().all(|a| a.path != first.path));

    agent.shutdown().await;
}

#[tokio::test]
async fn stalled_connection_fails_without_artifact() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.network.tcp_connection_timeout = 0.3;
    let agent = start_agent(cfg).await;

    let mut data = TcpStream::connect(on_loopback(agent.tcp_addr()))
        .await
        .unwrap();
    data.write_all(b"partial").await.unwrap();
    // Keep the connection open without further progress; the agent times
    // the session out and discards the partial payload.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(agent.store().list_artifacts().await.is_empty());
    // The aborted session removed its partial file too.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    drop(data);

    agent.shutdown().await;
}

#[tokio::test]
async fn concurrent_transfers_are_independent() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(test_config(&dir)).await;

    // Two announcements, then two parallel connections from this host.
    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..2 {
        control
            .send_to(&transfer_request_from("Scanner1"), on_loopback(agent.udp_addr()))
            .await
            .unwrap();
        recv_reply(&control).await;
    }

    let tcp_addr = on_loopback(agent.tcp_addr());
    let a = tokio::spawn(async move {
        let mut s = TcpStream::connect(tcp_addr).await.unwrap();
        s.write_all(&[b'a'; 4096]).await.unwrap();
        s.shutdown().await.unwrap();
    });
    let b = tokio::spawn(async move {
        let mut s = TcpStream::connect(tcp_addr).await.unwrap();
        s.write_all(&[b'b'; 2048]).await.unwrap();
        s.shutdown().await.unwrap();
    });
    a.await.unwrap();
    b.await.unwrap();

    let artifacts = wait_for_artifacts(&agent, 2).await;
    let mut sizes: Vec<u64> = artifacts.iter().map(|a| a.size).collect();
    sizes.sort();
    assert_eq!(sizes, vec![2048, 4096]);

    agent.shutdown().await;
}
