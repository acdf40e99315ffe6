//! Wire types and the framing codec layer.
//!
//! A connection carries exactly one handshake line followed by request and
//! response frames. The handshake is always a single line of JSON (an
//! [`Options`] object terminated by `\n`), independent of the codec it
//! negotiates; every later frame is a [`Header`] immediately followed by a
//! body value, both encoded by the negotiated [`ConnType`].
//!
//! Both codecs are length-free: the decoder recognizes value boundaries,
//! so [`ConnReader`] accumulates bytes and decodes incrementally. Writes go
//! through [`ConnWriter`], which buffers one frame and flushes it whole.

mod decode;
mod reader;
mod writer;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use reader::ConnReader;
pub use writer::ConnWriter;

use crate::error::{Result, RpcError};

/// Magic number carried in every handshake; identifies a fastrpc peer.
pub const MAGIC_NUMBER: u32 = 0x3BEF5C;

/// Default budget for transport connect + handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Message header preceding every request and response body.
///
/// Field names on the wire are `ServiceMethod`, `Seq`, `Error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Name of service and method, e.g. `"Foo.Sum"`.
    pub service_method: String,
    /// Request sequence number; client-assigned, starts at 1, 0 is invalid.
    pub seq: u64,
    /// Empty on requests and successful responses; a server-side failure
    /// message otherwise.
    pub error: String,
}

/// Body codec negotiated by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnType {
    /// Self-describing tagged binary (MessagePack with named fields).
    #[serde(rename = "application/gob")]
    Gob,
    /// JSON values on the wire.
    #[serde(rename = "application/json")]
    Json,
}

impl std::fmt::Display for ConnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnType::Gob => f.write_str("application/gob"),
            ConnType::Json => f.write_str("application/json"),
        }
    }
}

impl ConnType {
    /// Encode one body value with this codec.
    ///
    /// JSON values are newline-terminated: compact JSON never contains a
    /// raw newline, so the terminator is what lets the decoder find the
    /// end of bare numbers and other open-ended values.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            ConnType::Gob => Ok(rmp_serde::to_vec_named(value)?),
            ConnType::Json => {
                let mut bytes = serde_json::to_vec(value)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
        }
    }

    /// Decode one body value previously read off the wire.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            ConnType::Gob => Ok(rmp_serde::from_slice(bytes)?),
            ConnType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Handshake record exchanged before any frame.
///
/// Serialized as a JSON line with keys `MagicNumber`, `ConnType`,
/// `ConnectTimeout`, `HandleTimeout` (durations in nanoseconds). The
/// client sends it, the server verifies and echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u32,
    pub conn_type: ConnType,
    /// Client-side budget for connect + handshake; zero means no limit.
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    /// Server-side wall clock per request; zero means no limit.
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            conn_type: ConnType::Gob,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Options selecting the JSON codec, other fields at their defaults.
    pub fn json() -> Self {
        Self {
            conn_type: ConnType::Json,
            ..Self::default()
        }
    }

    /// Verify the magic number against [`MAGIC_NUMBER`].
    pub fn check_magic(&self) -> Result<()> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(RpcError::InvalidMagic(self.magic_number));
        }
        Ok(())
    }
}

/// Durations travel as integer nanoseconds, matching the wire format.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}
