//! HTTP CONNECT upgrade: answering RPC over an HTTP port.
//!
//! A client sends `CONNECT <rpc_path> HTTP/1.0` and, once it sees the
//! connected status line, speaks the normal RPC protocol on the same
//! socket. The exchange is a fixed byte preamble (see the wire contract),
//! so it is spoken directly on the stream; after the preamble the socket
//! is handed to the regular per-connection task. A debug page lists every
//! registered service with per-method call counts.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error};

use super::Server;

/// Default path answering CONNECT upgrades.
pub const DEFAULT_RPC_PATH: &str = "/_fastrpc_";

/// Default path of the debug page.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/fastrpc";

/// Status line (sans version) confirming the upgrade.
pub const CONNECTED_STATUS: &str = "200 Connected to FastRPC";

/// Largest request head accepted before the connection is dropped.
const MAX_HEAD: usize = 8 * 1024;

impl Server {
    /// Accept connections and answer HTTP on them: CONNECT upgrades on
    /// [`DEFAULT_RPC_PATH`], the debug page on [`DEFAULT_DEBUG_PATH`].
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        self.serve_http_at(listener, DEFAULT_RPC_PATH, DEFAULT_DEBUG_PATH)
            .await
    }

    /// [`Server::serve_http`] with configurable paths.
    pub async fn serve_http_at(
        self: Arc<Self>,
        listener: TcpListener,
        rpc_path: &str,
        debug_path: &str,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    let rpc_path = rpc_path.to_string();
                    let debug_path = debug_path.to_string();
                    tokio::spawn(async move {
                        server.handle_http_conn(stream, &rpc_path, &debug_path).await
                    });
                }
                Err(e) => {
                    error!("fastrpc server: accept error: {e}");
                    return;
                }
            }
        }
    }

    pub(crate) async fn handle_http_conn<S>(
        self: Arc<Self>,
        mut stream: S,
        rpc_path: &str,
        debug_path: &str,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let head_end = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_HEAD {
                debug!("fastrpc server: oversized http request head");
                return;
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!("fastrpc server: http read error: {e}");
                    return;
                }
            }
        };

        let head = buf.split_to(head_end);
        let request_line = match std::str::from_utf8(&head)
            .ok()
            .and_then(|head| head.lines().next())
        {
            Some(line) => line.trim_end_matches('\r').to_string(),
            None => return,
        };
        let mut parts = request_line.split_whitespace();
        let (method, path) = match (parts.next(), parts.next()) {
            (Some(method), Some(path)) => (method, path),
            _ => return,
        };

        if path == rpc_path {
            if method != "CONNECT" {
                let _ = stream
                    .write_all(
                        b"HTTP/1.0 405 Method Not Allowed\r\n\
                          Content-Type: text/plain; charset=utf-8\r\n\r\n\
                          405 must CONNECT\n",
                    )
                    .await;
                return;
            }
            let reply = format!("HTTP/1.0 {CONNECTED_STATUS}\n\n");
            if let Err(e) = stream.write_all(reply.as_bytes()).await {
                debug!("fastrpc server: http upgrade write error: {e}");
                return;
            }
            // Anything the client pipelined after its head belongs to the
            // RPC handshake.
            self.serve_conn_buffered(stream, buf).await;
        } else if path == debug_path && method == "GET" {
            let body = self.debug_html();
            let reply = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\
                 Content-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(reply.as_bytes()).await;
        } else {
            let _ = stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
        }
    }

    /// Service/method/call-count table rendered for the debug path.
    fn debug_html(&self) -> String {
        let mut page = String::from("<html>\n<body>\n<title>FastRPC Services</title>\n");
        for service in self.services() {
            page.push_str("<hr>\nService <b>");
            page.push_str(service.name());
            page.push_str("</b>\n<hr>\n<table>\n");
            page.push_str("<th align=center>Method</th><th align=center>Calls</th>\n");
            for method in service.methods() {
                page.push_str(&format!(
                    "<tr>\n<td align=left font=fixed>{}</td>\n<td align=center>{}</td>\n</tr>\n",
                    method.name(),
                    method.num_calls()
                ));
            }
            page.push_str("</table>\n");
        }
        page.push_str("</body>\n</html>");
        page
    }
}

/// Index just past the blank line ending a request head, if present.
pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
