//! Load-balancing client façade over one or many backends.
//!
//! [`XClient`] resolves a server address through a [`Discovery`]
//! implementation, keeps one [`Client`] per address (re-dialing dead
//! ones), and offers a single-server [`XClient::call`] plus an
//! all-servers [`XClient::broadcast`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::conn::Options;
use crate::error::{Result, RpcError};
use crate::registry::SERVERS_HEADER;

/// Load-balancing strategy for [`Discovery::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Pick a server at random.
    Random,
    /// Rotate through the servers.
    RoundRobin,
}

/// Minimal capability set the façade needs from service discovery.
pub trait Discovery: Send + Sync {
    /// Re-fetch the server list from a remote source, if there is one.
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send;
    /// Replace the server list.
    fn update(&self, servers: Vec<String>);
    /// Pick one server according to `mode`.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send;
    /// All known servers.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Discovery over a fixed, caller-maintained server list.
pub struct MultiServersDiscovery {
    servers: parking_lot::RwLock<Vec<String>>,
    /// Round-robin cursor; starts at a random offset so distinct clients
    /// do not all hammer the first server.
    index: AtomicUsize,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        Self {
            servers: parking_lot::RwLock::new(servers),
            index: AtomicUsize::new(index),
        }
    }

    fn pick(&self, mode: SelectMode) -> Result<String> {
        let servers = self.servers.read();
        let n = servers.len();
        if n == 0 {
            return Err(RpcError::Discovery("no available servers".to_string()));
        }
        match mode {
            SelectMode::Random => Ok(servers[rand::thread_rng().gen_range(0..n)].clone()),
            SelectMode::RoundRobin => {
                let index = self.index.fetch_add(1, Ordering::Relaxed);
                Ok(servers[index % n].clone())
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.servers.read().clone()
    }
}

impl Discovery for MultiServersDiscovery {
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send {
        // Nothing to refresh from.
        std::future::ready(Ok(()))
    }

    fn update(&self, servers: Vec<String>) {
        *self.servers.write() = servers;
    }

    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send {
        std::future::ready(self.pick(mode))
    }

    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send {
        std::future::ready(Ok(self.snapshot()))
    }
}

/// How long a fetched server list stays fresh by default.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by the HTTP registry; the server list is re-fetched
/// once it is older than the update timeout.
pub struct RegistryDiscovery {
    inner: MultiServersDiscovery,
    registry_url: String,
    update_timeout: Duration,
    last_update: parking_lot::Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `registry_url` is the full URL of the registry endpoint; a zero
    /// `update_timeout` selects [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: &str, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        Self {
            inner: MultiServersDiscovery::new(Vec::new()),
            registry_url: registry_url.to_string(),
            update_timeout,
            last_update: parking_lot::Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        {
            let last_update = self.last_update.lock();
            if last_update.is_some_and(|at| at.elapsed() < self.update_timeout) {
                return Ok(());
            }
        }
        debug!(
            "fastrpc registry: refresh servers from registry {}",
            self.registry_url
        );
        let response = self.http.get(&self.registry_url).send().await?;
        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();
        self.inner.update(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }
}

impl Discovery for RegistryDiscovery {
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send {
        self.refresh_if_stale()
    }

    fn update(&self, servers: Vec<String>) {
        self.inner.update(servers);
        *self.last_update.lock() = Some(Instant::now());
    }

    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send {
        async move {
            self.refresh_if_stale().await?;
            self.inner.pick(mode)
        }
    }

    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send {
        async move {
            self.refresh_if_stale().await?;
            Ok(self.inner.snapshot())
        }
    }
}

/// Client façade dispatching to one or many backends.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opts: Options,
    clients: tokio::sync::Mutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, opts: Options) -> Self {
        Self {
            discovery,
            mode,
            opts,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Cached client for `rpc_addr`, re-dialing if the cached one died.
    async fn cached_client(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            if let Some(dead) = clients.remove(rpc_addr) {
                let _ = dead.close().await;
            }
        }
        let client = Arc::new(Client::xdial(rpc_addr, self.opts.clone()).await?);
        clients.insert(rpc_addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn call_addr<A, R>(&self, rpc_addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.cached_client(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Call the named method on a server chosen by the select mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Call the named method on every known server concurrently.
    ///
    /// Returns the first successful reply; if any call failed, that first
    /// failure is returned instead and the remaining calls are cancelled.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let token = CancellationToken::new();
        let state = parking_lot::Mutex::new((None::<RpcError>, None::<R>));

        let state_ref = &state;
        let calls = servers.iter().map(|rpc_addr| {
            let token = token.clone();
            async move {
                let result = tokio::select! {
                    _ = token.cancelled() => {
                        Err(RpcError::Cancelled("broadcast cancelled".to_string()))
                    }
                    result = self.call_addr::<A, R>(rpc_addr, service_method, args) => result,
                };
                let mut state = state_ref.lock();
                match result {
                    Ok(reply) => {
                        if state.1.is_none() {
                            state.1 = Some(reply);
                        }
                    }
                    Err(e) => {
                        if state.0.is_none() {
                            state.0 = Some(e);
                            token.cancel();
                        }
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        match state.into_inner() {
            (Some(e), _) => Err(e),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(RpcError::Discovery("no available servers".to_string())),
        }
    }

    /// Close every cached client.
    pub async fn close(&self) {
        for (_, client) in self.clients.lock().await.drain() {
            let _ = client.close().await;
        }
    }
}
