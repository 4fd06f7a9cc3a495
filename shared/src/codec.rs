//! Bootup payload codecs: length-prefixed strings and address records.

use crate::frame::{FrameError, FrameReader};
use thiserror::Error;

/// Errors raised while decoding bootup payload fields.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("address host is empty")]
    EmptyHost,
}

/// Decode a `[len:u8][bytes]` string field.
pub fn parse_string(r: &mut FrameReader) -> Result<String, CodecError> {
    let len = r.fetch_byte()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

/// A remote address record: host plus optional port.
///
/// Wire form is `[hlen:u8][host bytes][port:u16 BE]`, where a zero port
/// means the client left the port unspecified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: Option<u16>,
}

impl Address {
    /// Decode an address record from the payload.
    pub fn parse(r: &mut FrameReader) -> Result<Self, CodecError> {
        let host = parse_string(r)?;
        if host.is_empty() {
            return Err(CodecError::EmptyHost);
        }

        let mut port_bytes = [0u8; 2];
        r.read_exact(&mut port_bytes)?;
        let port = match u16::from_be_bytes(port_bytes) {
            0 => None,
            p => Some(p),
        };

        Ok(Self { host, port })
    }

    /// Join host and port into a dialable authority, falling back to
    /// `default_port` when the record carried none. IPv6 literal hosts are
    /// bracketed.
    pub fn to_authority(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}
