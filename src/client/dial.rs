//! Dialers: TCP, Unix, HTTP CONNECT, and the `protocol@addr` front door.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::Client;
use crate::conn::Options;
use crate::error::{Result, RpcError};
use crate::server::http::find_head_end;
use crate::server::{CONNECTED_STATUS, DEFAULT_RPC_PATH};

impl Client {
    /// Connect to an RPC server over TCP.
    pub async fn dial(addr: &str, opts: Options) -> Result<Client> {
        let addr = addr.to_string();
        dial_budget(opts.connect_timeout, async move {
            let stream = TcpStream::connect(&addr).await?;
            Client::new(stream, opts).await
        })
        .await
    }

    /// Connect to an RPC server over a Unix socket.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opts: Options) -> Result<Client> {
        let path = path.to_string();
        dial_budget(opts.connect_timeout, async move {
            let stream = UnixStream::connect(&path).await?;
            Client::new(stream, opts).await
        })
        .await
    }

    /// Connect over TCP, upgrade via HTTP CONNECT on the default RPC
    /// path, then run the normal handshake on the hijacked socket.
    pub async fn dial_http(addr: &str, opts: Options) -> Result<Client> {
        Self::dial_http_path(addr, DEFAULT_RPC_PATH, opts).await
    }

    /// [`Client::dial_http`] against a custom RPC path.
    pub async fn dial_http_path(addr: &str, path: &str, opts: Options) -> Result<Client> {
        let addr = addr.to_string();
        let path = path.to_string();
        dial_budget(opts.connect_timeout, async move {
            let stream = TcpStream::connect(&addr).await?;
            let (stream, leftover) = http_connect(stream, &path).await?;
            Client::handshake(stream, leftover, opts).await
        })
        .await
    }

    /// Dial a `protocol@addr` address, e.g. `tcp@10.0.0.1:9999`,
    /// `unix@/tmp/fastrpc.sock` or `http@10.0.0.1:7001`.
    pub async fn xdial(rpc_addr: &str, opts: Options) -> Result<Client> {
        let parts: Vec<&str> = rpc_addr.split('@').collect();
        if parts.len() != 2 {
            return Err(RpcError::Protocol(format!(
                "fastrpc client: wrong format '{rpc_addr}', expect protocol@addr"
            )));
        }
        let (protocol, addr) = (parts[0], parts[1]);
        match protocol {
            "http" => Client::dial_http(addr, opts).await,
            "tcp" => Client::dial(addr, opts).await,
            #[cfg(unix)]
            "unix" => Client::dial_unix(addr, opts).await,
            _ => Err(RpcError::Protocol(format!(
                "fastrpc client: unsupported protocol '{protocol}'"
            ))),
        }
    }
}

/// Bound the whole connect + handshake sequence; zero disables the bound.
async fn dial_budget<F>(timeout: Duration, fut: F) -> Result<Client>
where
    F: Future<Output = Result<Client>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::ConnectTimeout(timeout)),
    }
}

/// Perform the CONNECT exchange; on success the socket is ready for the
/// RPC handshake. Bytes read past the response head are returned so the
/// handshake reader starts with them.
async fn http_connect<S>(mut stream: S, path: &str) -> Result<(S, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    stream
        .write_all(format!("CONNECT {path} HTTP/1.0\n\n").as_bytes())
        .await?;

    let mut buf = BytesMut::with_capacity(256);
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RpcError::Eof);
        }
    };

    let head = buf.split_to(head_end);
    let status_line = std::str::from_utf8(&head)
        .ok()
        .and_then(|head| head.lines().next())
        .map(|line| line.trim_end_matches('\r').to_string())
        .unwrap_or_default();

    let expected = format!("HTTP/1.0 {CONNECTED_STATUS}");
    if status_line != expected {
        return Err(RpcError::HttpUpgrade(status_line));
    }
    Ok((stream, buf))
}
