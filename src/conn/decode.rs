//! Incremental value decoding for the length-free codecs.
//!
//! Neither codec prefixes values with a length; the decoder itself
//! recognizes where a value ends. [`decode_value`] attempts to decode one
//! value from the front of a buffer and reports either the value plus the
//! number of bytes it occupied, or that more bytes are needed.

use serde::de::DeserializeOwned;

use super::ConnType;
use crate::error::{Result, RpcError};

/// Outcome of one decode attempt against a partially-filled buffer.
pub(crate) enum Progress<T> {
    /// A whole value was present; `consumed` bytes belong to it.
    Complete { value: T, consumed: usize },
    /// The buffer ends mid-value; read more and retry.
    Incomplete,
}

/// Try to decode one value of type `T` from the front of `buf`.
///
/// Truncated input is reported as [`Progress::Incomplete`]; any other
/// decode failure is a protocol-level error.
pub(crate) fn decode_value<T: DeserializeOwned>(kind: ConnType, buf: &[u8]) -> Result<Progress<T>> {
    match kind {
        ConnType::Json => decode_json(buf),
        ConnType::Gob => decode_msgpack(buf),
    }
}

fn decode_json<T: DeserializeOwned>(buf: &[u8]) -> Result<Progress<T>> {
    // One value per newline-terminated line (the encoder guarantees the
    // terminator). Parsing only whole lines keeps open-ended values such
    // as bare numbers unambiguous across packet boundaries.
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(Progress::Incomplete);
    };
    let value = serde_json::from_slice(&buf[..pos])?;
    Ok(Progress::Complete {
        value,
        consumed: pos + 1,
    })
}

fn decode_msgpack<T: DeserializeOwned>(buf: &[u8]) -> Result<Progress<T>> {
    let mut tracked = TrackedReader { buf, pos: 0 };
    let mut de = rmp_serde::Deserializer::new(&mut tracked);
    match T::deserialize(&mut de) {
        Ok(value) => {
            drop(de);
            Ok(Progress::Complete {
                consumed: tracked.pos,
                value,
            })
        }
        Err(e) if msgpack_truncated(&e) => Ok(Progress::Incomplete),
        Err(e) => Err(RpcError::Decode(e)),
    }
}

fn msgpack_truncated(e: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match e {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// `Read` adapter over a slice that records how far decoding got.
struct TrackedReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl std::io::Read for TrackedReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.buf[self.pos..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
