//! Integration tests for the probe loop over real loopback connections
//!
//! Each test starts one or more replica servers on ephemeral ports, points a
//! client at them, and exercises probing and selection end to end.

use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;

use prequal::client::{prober, Client, ClientError, SelectionMode};
use prequal::config::ClientConfig;
use prequal::server::ReplicaServer;

/// Bind a replica on an ephemeral port and serve it in the background.
async fn start_replica() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = ReplicaServer::new().serve(listener).await;
    });

    addr
}

fn client_config(servers: Vec<String>) -> ClientConfig {
    ClientConfig {
        max_probe_pool_size: 16,
        num_replicas: servers.len(),
        probe_rate: 1.0,
        q_rif_threshold: 0.75,
        delta_reuse: 0.1,
        max_probe_age: 5,
        servers,
    }
}

/// Send a bare HTTP request and return the response status.
async fn raw_request(addr: SocketAddr, method: &str, path: &str) -> StatusCode {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path))
        .header("Host", addr.to_string())
        .body(String::new())
        .unwrap();

    sender.send_request(req).await.unwrap().status()
}

#[tokio::test]
async fn test_selection_fails_before_first_round() {
    let addr = start_replica().await;
    let client = Client::new(client_config(vec![addr.to_string()]), SelectionMode::Hcl).unwrap();

    let err = client.select_replica("x").await.unwrap_err();
    assert!(matches!(err, ClientError::NoProbes));
}

#[tokio::test]
async fn test_probe_round_covers_every_replica() {
    let a = start_replica().await;
    let b = start_replica().await;
    let servers = vec![a.to_string(), b.to_string()];
    let client = Client::new(client_config(servers.clone()), SelectionMode::Hcl).unwrap();

    client.probe_round().await;

    let stats = client.pool_stats().await;
    for server in &servers {
        assert!(
            stats.probes.iter().any(|p| &p.server_id == server),
            "replica {} missing from the pool",
            server
        );
    }
    assert!(stats.probes.len() <= 16 + servers.len());

    // Selection resolves to one of the probed replicas.
    let chosen = client.select_replica("job").await.unwrap();
    assert!(servers.contains(&chosen));
}

#[tokio::test]
async fn test_pool_stays_bounded_across_rounds() {
    let a = start_replica().await;
    let b = start_replica().await;
    let servers = vec![a.to_string(), b.to_string()];

    let mut config = client_config(servers.clone());
    config.max_probe_pool_size = 3;
    let client = Client::new(config, SelectionMode::Hcl).unwrap();

    for _ in 0..5 {
        client.probe_round().await;
        let stats = client.pool_stats().await;
        assert!(
            stats.probes.len() <= 3 + servers.len(),
            "pool grew to {}",
            stats.probes.len()
        );
    }
}

#[tokio::test]
async fn test_idle_replica_reports_zero() {
    let addr = start_replica().await;

    let reply = prober::fetch_probe(&addr.to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(reply.rif, 0);
    assert_eq!(reply.latency(), Duration::ZERO);
}

#[tokio::test]
async fn test_probe_rejects_wrong_method() {
    let addr = start_replica().await;
    assert_eq!(
        raw_request(addr, "POST", "/probe").await,
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(
        raw_request(addr, "POST", "/ping").await,
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(
        raw_request(addr, "GET", "/nowhere").await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_unreachable_replica_is_skipped() {
    let live = start_replica().await;
    // Port 1 on loopback refuses connections immediately.
    let servers = vec![live.to_string(), "127.0.0.1:1".to_string()];
    let client = Client::new(client_config(servers), SelectionMode::Hcl).unwrap();

    client.probe_round().await;

    let stats = client.pool_stats().await;
    assert_eq!(stats.probes.len(), 1);
    assert_eq!(stats.probes[0].server_id, live.to_string());

    let chosen = client.select_replica("job").await.unwrap();
    assert_eq!(chosen, live.to_string());
}

#[tokio::test]
async fn test_completed_request_leaves_a_sample() {
    let addr = start_replica().await;
    let client = Client::new(
        client_config(vec![addr.to_string()]),
        SelectionMode::RoundRobin,
    )
    .unwrap();

    client.ping().await.unwrap();

    let reply = prober::fetch_probe(&addr.to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    // The ping has completed, so it no longer counts as in flight, but its
    // latency sample now backs the estimate.
    assert_eq!(reply.rif, 0);
    assert!(reply.latency() > Duration::ZERO);
}

#[tokio::test]
async fn test_round_robin_rotates() {
    let a = start_replica().await;
    let b = start_replica().await;
    let servers = vec![a.to_string(), b.to_string()];
    let client = Client::new(client_config(servers.clone()), SelectionMode::RoundRobin).unwrap();

    let first = client.select_replica("job").await.unwrap();
    let second = client.select_replica("job").await.unwrap();
    let third = client.select_replica("job").await.unwrap();

    assert_eq!(first, servers[0]);
    assert_eq!(second, servers[1]);
    assert_eq!(third, servers[0]);
}

#[tokio::test]
async fn test_prober_shutdown_is_cooperative() {
    let addr = start_replica().await;
    let client = std::sync::Arc::new(
        Client::new(client_config(vec![addr.to_string()]), SelectionMode::Hcl).unwrap(),
    );

    let handle = std::sync::Arc::clone(&client).start();

    // The first tick fires immediately; give the round a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.pool_stats().await.probes.is_empty());

    client.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("prober did not stop")
        .unwrap();
}
