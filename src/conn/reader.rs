//! Read half of a connection: incremental frame decoding.

use bytes::{Buf, Bytes, BytesMut};
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::decode::{decode_value, Progress};
use super::{ConnType, Header};
use crate::error::{Result, RpcError};

/// Boxed read half of a stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;

/// Decoding side of a connection.
///
/// Owns the read half of the stream and a byte buffer; values are decoded
/// incrementally off the front of the buffer so that frame boundaries
/// never depend on how the transport fragments the stream. Bytes read
/// past the current value (pipelined frames) stay buffered for the next
/// read, including across the handshake.
pub struct ConnReader {
    kind: ConnType,
    reader: BoxReader,
    buf: BytesMut,
}

impl ConnReader {
    pub fn new(kind: ConnType, reader: BoxReader) -> Self {
        Self::from_parts(kind, reader, BytesMut::with_capacity(READ_CHUNK))
    }

    /// Build a reader that starts with bytes already pulled off the stream
    /// (e.g. read together with an HTTP upgrade head).
    pub fn from_parts(kind: ConnType, reader: BoxReader, buf: BytesMut) -> Self {
        Self { kind, reader, buf }
    }

    /// Switch codec after the handshake settles it. The buffer is kept.
    pub(crate) fn set_kind(&mut self, kind: ConnType) {
        self.kind = kind;
    }

    /// Read one frame header.
    pub async fn read_header(&mut self) -> Result<Header> {
        self.read_value().await
    }

    /// Read one body value into a typed slot.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.read_value().await
    }

    /// Read one body value and hand back the exact bytes it occupied,
    /// without committing to a type.
    pub async fn read_body_raw(&mut self) -> Result<Bytes> {
        loop {
            if !self.buf.is_empty() {
                if let Progress::Complete { consumed, .. } =
                    decode_value::<IgnoredAny>(self.kind, &self.buf)?
                {
                    return Ok(self.buf.split_to(consumed).freeze());
                }
            }
            self.fill().await?;
        }
    }

    /// Drain one body value into a sink.
    pub async fn skip_body(&mut self) -> Result<()> {
        self.read_body_raw().await.map(|_| ())
    }

    async fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if !self.buf.is_empty() {
                if let Progress::Complete { value, consumed } =
                    decode_value::<T>(self.kind, &self.buf)?
                {
                    self.buf.advance(consumed);
                    return Ok(value);
                }
            }
            self.fill().await?;
        }
    }

    /// Read one `\n`-terminated JSON line, regardless of the negotiated
    /// codec. Used only for the handshake.
    pub(crate) async fn read_json_line<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                return Ok(serde_json::from_slice(&line)?);
            }
            self.fill().await?;
        }
    }

    /// Pull more bytes off the stream; zero bytes means the peer is gone.
    async fn fill(&mut self) -> Result<()> {
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(RpcError::Eof);
        }
        Ok(())
    }
}
