//! Server runtime: accept loop, per-connection pipeline, dispatch.
//!
//! Each accepted connection runs one task that performs the handshake and
//! then loops reading requests. Handlers run concurrently on their own
//! tasks; all response writes on a connection serialize through one send
//! mutex so frames are never interleaved, and the connection task joins
//! every handler before closing the codec.
//!
//! Only a header read failure ends the loop. A failed service lookup or
//! handler produces a per-request error response and the connection keeps
//! serving.

pub(crate) mod http;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub use http::{CONNECTED_STATUS, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};

use crate::conn::{ConnReader, ConnType, ConnWriter, Header, Options};
use crate::error::{Result, RpcError};
use crate::service::{Method, Service};

/// An RPC server: a read-mostly map of registered services.
pub struct Server {
    services: DashMap<String, Arc<Service>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Publish a service. Registering the same service name twice fails.
    pub fn register(&self, service: Service) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(RpcError::Protocol(format!(
                "fastrpc: service already defined: {}",
                service.name()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Registered services, sorted by name.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut all: Vec<_> = self
            .services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Accept TCP connections and serve each on its own task until the
    /// listener fails.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
                Err(e) => {
                    error!("fastrpc server: accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Accept Unix-socket connections, same contract as [`Server::accept`].
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
                Err(e) => {
                    error!("fastrpc server: accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Serve one already-established stream: handshake, then the request
    /// loop. Used by the accept loops and by the HTTP CONNECT upgrade.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_conn_buffered(stream, BytesMut::new()).await
    }

    /// Like [`Server::serve_conn`], starting with bytes already pulled off
    /// the stream.
    pub(crate) async fn serve_conn_buffered<S>(self: Arc<Self>, stream: S, initial: BytesMut)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = ConnReader::from_parts(ConnType::Json, Box::new(read_half), initial);

        let opts: Options = match reader.read_json_line().await {
            Ok(opts) => opts,
            Err(e) => {
                debug!("fastrpc server: option decode error: {e}");
                return;
            }
        };
        if let Err(e) = opts.check_magic() {
            error!("fastrpc server: {e}");
            return;
        }
        reader.set_kind(opts.conn_type);

        // Echo the accepted options back as the handshake acknowledgement.
        let mut writer = ConnWriter::new(opts.conn_type, Box::new(write_half));
        if let Err(e) = writer.write_json_line(&opts).await {
            error!("fastrpc server: option encode error: {e}");
            return;
        }

        self.serve_codec(reader, writer, &opts).await;
    }

    async fn serve_codec(self: Arc<Self>, mut reader: ConnReader, writer: ConnWriter, opts: &Options) {
        let writer = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();
        let kind = opts.conn_type;

        loop {
            let mut header = match reader.read_header().await {
                Ok(header) => header,
                Err(RpcError::Eof) => break,
                Err(e) => {
                    error!("fastrpc server: read header error: {e}");
                    break;
                }
            };

            match self.find_method(&header.service_method) {
                Err(msg) => {
                    // Drain the request body so the stream stays framed,
                    // then answer with the lookup failure.
                    if let Err(e) = reader.skip_body().await {
                        if !matches!(e, RpcError::Eof) {
                            warn!("fastrpc server: read body error: {e}");
                        }
                    }
                    header.error = msg;
                    send_response(&writer, &header, &()).await;
                }
                Ok(method) => {
                    let arg = match reader.read_body_raw().await {
                        Ok(arg) => arg,
                        Err(e) => {
                            warn!("fastrpc server: read body error: {e}");
                            Bytes::new()
                        }
                    };
                    handlers.spawn(handle_request(
                        Arc::clone(&writer),
                        kind,
                        header,
                        method,
                        arg,
                        opts.handle_timeout,
                    ));
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
    }

    /// Resolve `"<Service>.<Method>"`, splitting at the last dot.
    fn find_method(&self, service_method: &str) -> std::result::Result<Arc<Method>, String> {
        let Some(dot) = service_method.rfind('.') else {
            return Err(format!(
                "fastrpc server: service/method request ill-formed: {service_method}"
            ));
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let Some(service) = self.services.get(service_name) else {
            return Err(format!("fastrpc server: can't find service: {service_name}"));
        };
        service
            .method(method_name)
            .ok_or_else(|| format!("fastrpc server: can't find method: {method_name}"))
    }
}

/// Run one invocation and write its response.
///
/// With a handle timeout, the invocation races a timer: if the timer
/// fires first, a synthetic error response goes out immediately. The
/// invocation keeps running on its own task and its eventual response is
/// written too; the client has already dropped the pending entry by then
/// and drains the duplicate.
async fn handle_request(
    writer: Arc<Mutex<ConnWriter>>,
    kind: ConnType,
    header: Header,
    method: Arc<Method>,
    arg: Bytes,
    timeout: Duration,
) {
    let (called_tx, called_rx) = oneshot::channel::<()>();

    let invocation = {
        let writer = Arc::clone(&writer);
        let mut header = header.clone();
        tokio::spawn(async move {
            let result = method.invoke(kind, arg).await;
            let _ = called_tx.send(());
            match result {
                Ok(reply) => send_response_raw(&writer, &header, &reply).await,
                Err(msg) => {
                    header.error = msg;
                    send_response(&writer, &header, &()).await;
                }
            }
        })
    };

    if timeout.is_zero() {
        let _ = invocation.await;
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            let mut header = header;
            header.error =
                format!("fastrpc server: request handle timeout: expect within {timeout:?}");
            send_response(&writer, &header, &()).await;
        }
        _ = called_rx => {
            let _ = invocation.await;
        }
    }
}

async fn send_response<B: Serialize>(writer: &Mutex<ConnWriter>, header: &Header, body: &B) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_frame(header, body).await {
        error!("fastrpc server: write response error: {e}");
    }
}

async fn send_response_raw(writer: &Mutex<ConnWriter>, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_frame_raw(header, body).await {
        error!("fastrpc server: write response error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_foo() -> Server {
        let server = Server::new();
        server
            .register(
                Service::build("Foo")
                    .method("Sum", |args: (i64, i64)| async move {
                        Ok::<_, String>(args.0 + args.1)
                    })
                    .finish(),
            )
            .unwrap();
        server
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let server = server_with_foo();
        let dup = Service::build("Foo").finish();
        let err = server.register(dup).unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn test_find_method_errors() {
        let server = server_with_foo();

        assert!(server.find_method("Foo.Sum").is_ok());
        assert!(server
            .find_method("NoDotHere")
            .unwrap_err()
            .contains("ill-formed"));
        assert!(server
            .find_method("Bar.Sum")
            .unwrap_err()
            .contains("can't find service"));
        assert!(server
            .find_method("Foo.Missing")
            .unwrap_err()
            .contains("can't find method"));
    }

    #[test]
    fn test_find_method_splits_at_last_dot() {
        let server = Server::new();
        server
            .register(
                Service::build("a.b")
                    .method("c", |_: ()| async { Ok::<_, String>(()) })
                    .finish(),
            )
            .unwrap();
        assert!(server.find_method("a.b.c").is_ok());
    }

    #[test]
    fn test_services_sorted() {
        let server = Server::new();
        server.register(Service::build("Zeta").finish()).unwrap();
        server.register(Service::build("Alpha").finish()).unwrap();

        let names: Vec<_> = server.services().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["Alpha", "Zeta"]);
    }
}
