//! Client runtime: call multiplexer over one connection.
//!
//! A [`Client`] may carry any number of outstanding calls and be shared
//! across tasks. Submission assigns a fresh sequence number, registers the
//! call in the pending table and writes the request frame, all under the
//! send mutex so the frame on the wire always matches the entry just
//! registered. A background receiver matches response headers back to
//! pending entries; responses may arrive in any order.
//!
//! Cancellation is by drop: a [`Call`] that is dropped before completion
//! removes its pending entry, so wrapping [`Client::call`] in
//! `tokio::time::timeout` (or selecting against anything else) leaves the
//! client usable and the late response is drained as a pending miss.

mod dial;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::{ConnReader, ConnType, ConnWriter, Header, Options};
use crate::error::{Result, RpcError};

type CallOutcome = Result<Bytes>;

/// State behind the client lock: sequence counter, pending table, phase.
struct Inner {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// User called `close`.
    closing: bool,
    /// Receiver observed a terminal read error.
    shutdown: bool,
}

struct Shared {
    inner: parking_lot::Mutex<Inner>,
}

impl Shared {
    fn remove(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.inner.lock().pending.remove(&seq)
    }
}

/// An RPC client bound to one connection.
pub struct Client {
    kind: ConnType,
    opts: Options,
    /// Send mutex: held across register + write so request frames are
    /// whole and ordered with their pending entries.
    writer: Arc<Mutex<ConnWriter>>,
    shared: Arc<Shared>,
    /// Fired by `close`; stops the receiver.
    closed: CancellationToken,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("kind", &self.kind)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over an already-established stream: run the
    /// handshake and start the background receiver.
    pub async fn new<S>(stream: S, opts: Options) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Client::handshake(stream, bytes::BytesMut::new(), opts).await
    }

    /// Run the handshake over an established stream and start the
    /// receiver. `initial` carries bytes already read off the stream.
    pub(crate) async fn handshake<S>(
        stream: S,
        initial: bytes::BytesMut,
        opts: Options,
    ) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let kind = opts.conn_type;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = ConnReader::from_parts(kind, Box::new(read_half), initial);
        let mut writer = ConnWriter::new(kind, Box::new(write_half));

        writer.write_json_line(&opts).await?;
        let echo: Options = reader.read_json_line().await?;
        echo.check_magic()?;

        let client = Client {
            kind,
            opts,
            writer: Arc::new(Mutex::new(writer)),
            shared: Arc::new(Shared {
                inner: parking_lot::Mutex::new(Inner {
                    seq: 1,
                    pending: HashMap::new(),
                    closing: false,
                    shutdown: false,
                }),
            }),
            closed: CancellationToken::new(),
        };

        tokio::spawn(receive(
            reader,
            Arc::clone(&client.shared),
            Arc::clone(&client.writer),
            client.closed.clone(),
        ));

        Ok(client)
    }

    /// Negotiated options for this connection.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// True until `close` is called or the receiver shuts the client down.
    pub fn is_available(&self) -> bool {
        let inner = self.shared.inner.lock();
        !inner.closing && !inner.shutdown
    }

    /// Submit a call asynchronously; the returned handle resolves when
    /// the response arrives.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Result<Call> {
        let body = self.kind.encode(args)?;

        let mut writer = self.writer.lock().await;
        let (seq, rx) = {
            let mut inner = self.shared.inner.lock();
            if inner.closing || inner.shutdown {
                return Err(RpcError::NotAvailable);
            }
            let seq = inner.seq;
            inner.seq += 1;
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(seq, tx);
            (seq, rx)
        };

        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write_frame_raw(&header, &body).await {
            // If the entry is already gone the receiver beat us to it and
            // the response stands; otherwise the write failure is the
            // call's outcome.
            if let Some(tx) = self.shared.remove(seq) {
                let _ = tx.send(Err(e));
            }
        }
        drop(writer);

        Ok(Call {
            seq,
            service_method: service_method.to_string(),
            kind: self.kind,
            rx,
            shared: Arc::clone(&self.shared),
            finished: false,
        })
    }

    /// Call and wait for the reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.recv().await
    }

    /// [`Client::call`] bounded by a deadline; zero means no limit. On
    /// expiry the pending entry is dropped and the caller gets a
    /// cancellation error.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if timeout.is_zero() {
            return self.call(service_method, args).await;
        }
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Cancelled("deadline has elapsed".to_string())),
        }
    }

    /// Close the connection. A second close reports the client as already
    /// closed; every call still pending fails promptly.
    pub async fn close(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closing {
                return Err(RpcError::Closed);
            }
            inner.closing = true;
        }
        self.closed.cancel();
        self.writer.lock().await.close().await
    }
}

/// Handle for one in-flight call.
///
/// Dropping the handle before [`Call::recv`] completes cancels the call
/// locally: the pending entry is removed and any late response is
/// discarded by the receiver.
pub struct Call {
    seq: u64,
    service_method: String,
    kind: ConnType,
    rx: oneshot::Receiver<CallOutcome>,
    shared: Arc<Shared>,
    finished: bool,
}

impl Call {
    /// Sequence number assigned at submission.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the terminal outcome and decode the reply.
    pub async fn recv<R: DeserializeOwned>(mut self) -> Result<R> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Ok(body)) => self.kind.decode(&body),
            Ok(Err(e)) => Err(e),
            // Sender vanished without a verdict: the client is gone.
            Err(_) => Err(RpcError::Shutdown("connection closed".to_string())),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.inner.lock().pending.remove(&self.seq);
        }
    }
}

/// Receiver loop: match responses to pending calls or drain them.
///
/// Exits on any read error or on `close`; either way every remaining
/// pending call is failed exactly once, under send → state lock order.
async fn receive(
    mut reader: ConnReader,
    shared: Arc<Shared>,
    writer: Arc<Mutex<ConnWriter>>,
    closed: CancellationToken,
) {
    let err = loop {
        let header = tokio::select! {
            _ = closed.cancelled() => break RpcError::Closed,
            header = reader.read_header() => match header {
                Ok(header) => header,
                Err(e) => break e,
            },
        };

        match shared.remove(header.seq) {
            // Partial write or locally cancelled call; the body still
            // occupies the stream.
            None => {
                if let Err(e) = reader.skip_body().await {
                    break e;
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let drained = reader.skip_body().await;
                let _ = tx.send(Err(RpcError::Remote(header.error)));
                if let Err(e) = drained {
                    break e;
                }
            }
            Some(tx) => match reader.read_body_raw().await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(e) => {
                    let _ = tx.send(Err(RpcError::Protocol(format!("reading body: {e}"))));
                    break e;
                }
            },
        }
    };

    debug!("fastrpc client: receiver stopped: {err}");

    // Terminate every pending call with the terminal error.
    let _writer = writer.lock().await;
    let mut inner = shared.inner.lock();
    inner.shutdown = true;
    for (_, tx) in inner.pending.drain() {
        let _ = tx.send(Err(RpcError::Shutdown(err.to_string())));
    }
}
