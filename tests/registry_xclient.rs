//! Registry heartbeats, registry-backed discovery and the load-balancing
//! client façade.

use std::sync::Arc;
use std::time::Duration;

use fastrpc::registry::{self, Registry, DEFAULT_REGISTRY_PATH, SERVER_HEADER};
use fastrpc::{
    Discovery, MultiServersDiscovery, Options, RegistryDiscovery, SelectMode, Server, Service,
    XClient,
};
use tokio::net::TcpListener;

/// Start a server whose `Who.Id` method reports `tag`; returns its
/// `tcp@addr` address.
async fn start_tagged_server(tag: i64) -> String {
    let server = Arc::new(Server::new());
    server
        .register(
            Service::build("Who")
                .method("Id", move |_: ()| async move { Ok::<_, String>(tag) })
                .method("Fail", |_: ()| async move {
                    Err::<i64, _>("deliberate failure".to_string())
                })
                .finish(),
        )
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.accept(listener).await });
    format!("tcp@{addr}")
}

async fn start_registry(timeout: Duration) -> String {
    let registry = Arc::new(Registry::new(timeout));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(registry.serve(listener));
    format!("http://{addr}{DEFAULT_REGISTRY_PATH}")
}

#[tokio::test]
async fn test_heartbeat_and_discovery_refresh() {
    let registry_url = start_registry(Duration::from_secs(60)).await;

    registry::heartbeat(&registry_url, "tcp@10.0.0.1:7001", Duration::ZERO)
        .await
        .unwrap();
    registry::heartbeat(&registry_url, "tcp@10.0.0.2:7002", Duration::ZERO)
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(&registry_url, Duration::ZERO);
    discovery.refresh().await.unwrap();
    assert_eq!(
        discovery.get_all().await.unwrap(),
        ["tcp@10.0.0.1:7001", "tcp@10.0.0.2:7002"]
    );
}

#[tokio::test]
async fn test_register_without_header_is_rejected() {
    let registry_url = start_registry(Duration::from_secs(60)).await;

    let response = reqwest::Client::new()
        .post(&registry_url)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    let response = reqwest::Client::new()
        .post(&registry_url)
        .header(SERVER_HEADER, "tcp@10.0.0.1:7001")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_xclient_round_robin_hits_every_server() {
    let first = start_tagged_server(1).await;
    let second = start_tagged_server(2).await;

    let discovery = MultiServersDiscovery::new(vec![first, second]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    let mut seen = std::collections::HashSet::new();
    for _ in 0..2 {
        let id: i64 = xclient.call("Who.Id", &()).await.unwrap();
        seen.insert(id);
    }
    assert_eq!(seen.len(), 2);
    xclient.close().await;
}

#[tokio::test]
async fn test_xclient_broadcast_returns_a_reply() {
    let first = start_tagged_server(1).await;
    let second = start_tagged_server(2).await;

    let discovery = MultiServersDiscovery::new(vec![first, second]);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let id: i64 = xclient.broadcast("Who.Id", &()).await.unwrap();
    assert!(id == 1 || id == 2);
    xclient.close().await;
}

#[tokio::test]
async fn test_xclient_broadcast_surfaces_failure() {
    let first = start_tagged_server(1).await;
    let second = start_tagged_server(2).await;

    let discovery = MultiServersDiscovery::new(vec![first, second]);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let err = xclient
        .broadcast::<_, i64>("Who.Fail", &())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("deliberate failure"));
    xclient.close().await;
}

#[tokio::test]
async fn test_xclient_call_through_registry_discovery() {
    let registry_url = start_registry(Duration::from_secs(60)).await;
    let addr = start_tagged_server(7).await;
    registry::heartbeat(&registry_url, &addr, Duration::ZERO)
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(&registry_url, Duration::ZERO);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let id: i64 = xclient.call("Who.Id", &()).await.unwrap();
    assert_eq!(id, 7);
    xclient.close().await;
}

#[tokio::test]
async fn test_dead_backend_is_redialed() {
    let addr = start_tagged_server(5).await;
    let discovery = MultiServersDiscovery::new(vec![addr]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    let id: i64 = xclient.call("Who.Id", &()).await.unwrap();
    assert_eq!(id, 5);

    // Kill the cached client; the façade must dial a fresh one.
    xclient.close().await;
    let id: i64 = xclient.call("Who.Id", &()).await.unwrap();
    assert_eq!(id, 5);
}
