//! HTTP registry: server addresses kept alive by heartbeats.
//!
//! The registry is a plain HTTP service; everything useful travels in
//! headers. `GET` answers with the alive server list in
//! `X-Fastrpc-Servers`; `POST` registers (or refreshes) the address in
//! `X-Fastrpc-Server`. Servers call [`heartbeat`] to register themselves
//! and keep their entry fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::Result;

/// Default path the registry is mounted on.
pub const DEFAULT_REGISTRY_PATH: &str = "/fastrpc/registry";

/// Response header carrying the comma-joined alive server list.
pub const SERVERS_HEADER: &str = "x-fastrpc-servers";

/// Request header carrying the address being registered.
pub const SERVER_HEADER: &str = "x-fastrpc-server";

/// Entries older than this are dropped; heartbeats reset the clock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A register center: addresses plus their last heartbeat.
pub struct Registry {
    timeout: Duration,
    servers: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// Create a registry; entries expire after `timeout` (zero disables
    /// expiry).
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn put_server(&self, addr: &str) {
        self.servers
            .lock()
            .insert(addr.to_string(), Instant::now());
    }

    /// Alive servers, sorted; expired entries are removed on the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        let timeout = self.timeout;
        if !timeout.is_zero() {
            servers.retain(|_, start| start.elapsed() < timeout);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Router serving this registry on [`DEFAULT_REGISTRY_PATH`].
    pub fn router(self: Arc<Self>) -> Router {
        self.router_at(DEFAULT_REGISTRY_PATH)
    }

    /// Router serving this registry on a custom path.
    pub fn router_at(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(list_servers).post(register_server))
            .with_state(self)
    }

    /// Serve the registry until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let router = Arc::clone(&self).router();
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(SERVERS_HEADER, registry.alive_servers().join(","))],
    )
}

async fn register_server(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty())
    {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Register `addr` with the registry and keep it alive.
///
/// Sends one heartbeat immediately (errors are returned), then spawns a
/// ticker that re-sends every `period` until a send fails. A zero period
/// defaults to the registry timeout minus a minute.
pub async fn heartbeat(registry_url: &str, addr: &str, period: Duration) -> Result<()> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    let http = reqwest::Client::new();
    send_heartbeat(&http, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!("fastrpc server: heartbeat error: {e}");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    debug!("{addr} send heartbeat to registry {registry_url}");
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
