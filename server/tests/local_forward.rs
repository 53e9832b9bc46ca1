//! End-to-end tests of the local forwarder runtime driven through the
//! manager, the way the admin layer drives it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fabric_server::manager::ForwardManager;
use fabric_server::models::ForwardRule;
use fabric_server::store::{MemoryStore, Store};

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

async fn ephemeral_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn forward_rule(listen_port: u16, target_port: u16, bandwidth_limit: i64) -> ForwardRule {
    ForwardRule {
        name: "local".into(),
        listen_port,
        target_address: "127.0.0.1".into(),
        target_port,
        bandwidth_limit,
        is_active: true,
        ..ForwardRule::default()
    }
}

#[tokio::test]
async fn local_tcp_forward_counts_both_directions() {
    let store = Arc::new(MemoryStore::new());
    let manager = ForwardManager::new(store.clone());

    let echo_port = spawn_echo_server().await;
    let listen_port = ephemeral_port().await;
    let rule = store.insert_rule(forward_rule(listen_port, echo_port, 0));
    manager.start(&rule).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let payload = [0x5au8; 128];
    client.write_all(&payload).await.unwrap();
    let mut reply = [0u8; 128];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, payload);

    let stats = manager.stats_of(rule.id).unwrap();
    assert!(stats.up_bytes >= 128);
    assert!(stats.down_bytes >= 128);
    assert!(stats.connections >= 1);

    drop(client);
    manager.stop(rule.id).await.unwrap();
    manager.stop(rule.id).await.unwrap();
}

#[tokio::test]
async fn bandwidth_limit_paces_the_upstream_direction() {
    let store = Arc::new(MemoryStore::new());
    let manager = ForwardManager::new(store.clone());

    let echo_port = spawn_echo_server().await;
    let listen_port = ephemeral_port().await;
    // 4 KiB/s with a 4 KiB burst: 16 KiB should take ≈3 s end to end.
    let rule = store.insert_rule(forward_rule(listen_port, echo_port, 4096));
    manager.start(&rule).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let payload = vec![1u8; 16 * 1024];
    let started = Instant::now();
    client.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_secs(2),
        "rate limit not applied: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");

    let stats = manager.stats_of(rule.id).unwrap();
    assert!(stats.up_bytes >= payload.len() as u64);

    manager.stop(rule.id).await.unwrap();
}

#[tokio::test]
async fn persisted_counters_reach_the_rule_row() {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(ForwardManager::new(store.clone()));

    let echo_port = spawn_echo_server().await;
    let listen_port = ephemeral_port().await;
    let rule = store.insert_rule(forward_rule(listen_port, echo_port, 0));
    manager.start(&rule).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(&[9u8; 512]).await.unwrap();
    let mut reply = vec![0u8; 512];
    client.read_exact(&mut reply).await.unwrap();

    // Drive one persist pass by hand the way the 5 s loop does.
    for (id, stats) in manager.stats() {
        store.update_rule_traffic(id, stats.up_bytes, stats.down_bytes, stats.connections);
    }
    let row = store.rule(rule.id).unwrap();
    assert!(row.traffic_up >= 512);
    assert!(row.traffic_down >= 512);

    manager.stop(rule.id).await.unwrap();
}
