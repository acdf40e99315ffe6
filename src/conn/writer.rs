//! Write half of a connection: buffered, frame-atomic writes.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::{ConnType, Header};
use crate::error::Result;

/// Boxed write half of a stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Encoding side of a connection.
///
/// Header and body are two encode operations; the buffered writer keeps
/// them in one flush so a frame is never fragmented across writes that
/// another task could interleave with. Any write error shuts the stream
/// down before returning.
pub struct ConnWriter {
    kind: ConnType,
    writer: BufWriter<BoxWriter>,
}

impl ConnWriter {
    pub fn new(kind: ConnType, writer: BoxWriter) -> Self {
        Self {
            kind,
            writer: BufWriter::new(writer),
        }
    }

    /// Write one frame: header, then a typed body.
    pub async fn write_frame<B: Serialize>(&mut self, header: &Header, body: &B) -> Result<()> {
        let body = self.kind.encode(body)?;
        self.write_frame_raw(header, &body).await
    }

    /// Write one frame with a body already encoded for this codec.
    pub async fn write_frame_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let head = self.kind.encode(header)?;
        let res = async {
            self.writer.write_all(&head).await?;
            self.writer.write_all(body).await?;
            self.writer.flush().await?;
            Ok(())
        }
        .await;
        if res.is_err() {
            let _ = self.writer.shutdown().await;
        }
        res
    }

    /// Write one `\n`-terminated JSON line. Used only for the handshake.
    pub(crate) async fn write_json_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let res = async {
            self.writer.write_all(&line).await?;
            self.writer.flush().await?;
            Ok(())
        }
        .await;
        if res.is_err() {
            let _ = self.writer.shutdown().await;
        }
        res
    }

    /// Flush and shut down the stream.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::conn::ConnReader;

    #[tokio::test]
    async fn test_frame_roundtrip_both_codecs() {
        for kind in [ConnType::Gob, ConnType::Json] {
            let (client, server) = duplex(1024);
            let mut writer = ConnWriter::new(kind, Box::new(client));
            let mut reader = ConnReader::new(kind, Box::new(server));

            let header = Header {
                service_method: "Foo.Mul".to_string(),
                seq: 9,
                error: String::new(),
            };
            writer.write_frame(&header, &(6u32, 7u32)).await.unwrap();

            assert_eq!(reader.read_header().await.unwrap(), header);
            let body: (u32, u32) = reader.read_body().await.unwrap();
            assert_eq!(body, (6, 7));
        }
    }

    #[tokio::test]
    async fn test_raw_body_passthrough() {
        let kind = ConnType::Gob;
        let (client, server) = duplex(1024);
        let mut writer = ConnWriter::new(kind, Box::new(client));
        let mut reader = ConnReader::new(kind, Box::new(server));

        let header = Header {
            service_method: "Foo.Sum".to_string(),
            seq: 1,
            error: String::new(),
        };
        let body = kind.encode(&123u64).unwrap();
        writer.write_frame_raw(&header, &body).await.unwrap();

        reader.read_header().await.unwrap();
        let reply: u64 = reader.read_body().await.unwrap();
        assert_eq!(reply, 123);
    }

    #[tokio::test]
    async fn test_close_signals_eof() {
        let kind = ConnType::Json;
        let (client, server) = duplex(64);
        let mut writer = ConnWriter::new(kind, Box::new(client));
        let mut reader = ConnReader::new(kind, Box::new(server));

        writer.close().await.unwrap();
        assert!(reader.read_header().await.is_err());
    }
}
