//! Frame markers and the chunked frame-payload reader.
//!
//! Every frame on the client stream starts with a one-byte marker. The outer
//! multiplexer owns the frame header; this module only defines the marker
//! vocabulary and a reader over one frame's payload as it was delivered
//! (an ordered sequence of byte chunks).

use std::collections::VecDeque;
use thiserror::Error;

/// Errors raised while consuming a frame payload.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The payload ended before the expected number of bytes arrived.
    #[error("frame payload ended unexpectedly")]
    UnexpectedEnd,

    /// The one-byte marker does not name a known client signal.
    #[error("unknown client signal marker: {0:#04x}")]
    UnknownClientSignal(u8),

    /// The one-byte selector does not name a known auth method.
    #[error("unknown auth method selector: {0:#04x}")]
    UnknownAuthMethod(u8),
}

/// Server -> client frame markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerSignal {
    RemoteStdOut = 0x00,
    RemoteStdErr = 0x01,
    HookOutputBeforeConnecting = 0x02,
    ConnectFailed = 0x03,
    ConnectSucceed = 0x04,
    ConnectVerifyFingerprint = 0x05,
    ConnectRequestCredential = 0x06,
}

impl ServerSignal {
    /// The wire marker byte for this signal.
    pub fn marker(self) -> u8 {
        self as u8
    }
}

/// Client -> server frame markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientSignal {
    StdIn = 0x00,
    Resize = 0x01,
    RespondFingerprint = 0x02,
    RespondCredential = 0x03,
}

impl TryFrom<u8> for ClientSignal {
    type Error = FrameError;

    fn try_from(marker: u8) -> Result<Self, FrameError> {
        match marker {
            0x00 => Ok(Self::StdIn),
            0x01 => Ok(Self::Resize),
            0x02 => Ok(Self::RespondFingerprint),
            0x03 => Ok(Self::RespondCredential),
            other => Err(FrameError::UnknownClientSignal(other)),
        }
    }
}

/// Error codes returned through the FSM error channel when a bootup payload
/// is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamErrorCode {
    BadUserName = 0x01,
    BadRemoteAddress = 0x02,
    BadAuthMethod = 0x03,
}

impl StreamErrorCode {
    /// The wire code byte.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Authentication method selected by the bootup payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    None = 0x00,
    Passphrase = 0x01,
    PrivateKey = 0x02,
}

impl TryFrom<u8> for AuthMethod {
    type Error = FrameError;

    fn try_from(selector: u8) -> Result<Self, FrameError> {
        match selector {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Passphrase),
            0x02 => Ok(Self::PrivateKey),
            other => Err(FrameError::UnknownAuthMethod(other)),
        }
    }
}

/// Reader over one inbound frame's payload.
///
/// The multiplexer delivers a payload as an ordered sequence of byte chunks;
/// the reader preserves those delivery units (`buffered`) while also
/// supporting exact reads that cross chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameReader {
    chunks: VecDeque<Vec<u8>>,
    remaining: usize,
}

impl FrameReader {
    /// Build a reader over the payload chunks as delivered.
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let chunks: VecDeque<Vec<u8>> =
            chunks.into_iter().filter(|c| !c.is_empty()).collect();
        let remaining = chunks.iter().map(Vec::len).sum();
        Self { chunks, remaining }
    }

    /// Total number of unread payload bytes.
    pub fn remains(&self) -> usize {
        self.remaining
    }

    /// Whether the whole payload has been consumed.
    pub fn completed(&self) -> bool {
        self.remaining == 0
    }

    /// The next payload chunk, in delivery order.
    pub fn buffered(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.remaining -= chunk.len();
        Some(chunk)
    }

    /// Exactly one byte, crossing chunk boundaries if needed.
    pub fn fetch_byte(&mut self) -> Result<u8, FrameError> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Fill `buf` exactly, crossing chunk boundaries if needed.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        if self.remaining < buf.len() {
            return Err(FrameError::UnexpectedEnd);
        }

        let mut filled = 0;
        while filled < buf.len() {
            let mut chunk = match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => return Err(FrameError::UnexpectedEnd),
            };

            let take = chunk.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;
            self.remaining -= take;

            if take < chunk.len() {
                chunk.drain(..take);
                self.chunks.push_front(chunk);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_signal_round_trip() {
        for marker in 0x00u8..=0x03 {
            let signal = ClientSignal::try_from(marker).unwrap();
            assert_eq!(signal as u8, marker);
        }
    }

    #[test]
    fn test_client_signal_unknown() {
        let err = ClientSignal::try_from(0x7f).unwrap_err();
        assert!(matches!(err, FrameError::UnknownClientSignal(0x7f)));
    }

    #[test]
    fn test_auth_method_round_trip() {
        assert_eq!(AuthMethod::try_from(0x00).unwrap(), AuthMethod::None);
        assert_eq!(AuthMethod::try_from(0x01).unwrap(), AuthMethod::Passphrase);
        assert_eq!(AuthMethod::try_from(0x02).unwrap(), AuthMethod::PrivateKey);
        assert!(AuthMethod::try_from(0x03).is_err());
    }

    #[test]
    fn test_server_signal_markers() {
        assert_eq!(ServerSignal::RemoteStdOut.marker(), 0x00);
        assert_eq!(ServerSignal::ConnectRequestCredential.marker(), 0x06);
    }

    #[test]
    fn test_stream_error_codes() {
        assert_eq!(StreamErrorCode::BadUserName.code(), 0x01);
        assert_eq!(StreamErrorCode::BadRemoteAddress.code(), 0x02);
        assert_eq!(StreamErrorCode::BadAuthMethod.code(), 0x03);
    }

    #[test]
    fn test_reader_buffered_preserves_chunks() {
        let mut r = FrameReader::new([vec![1, 2], vec![3], vec![4, 5, 6]]);
        assert_eq!(r.remains(), 6);
        assert_eq!(r.buffered(), Some(vec![1, 2]));
        assert_eq!(r.buffered(), Some(vec![3]));
        assert_eq!(r.remains(), 3);
        assert!(!r.completed());
        assert_eq!(r.buffered(), Some(vec![4, 5, 6]));
        assert!(r.completed());
        assert_eq!(r.buffered(), None);
    }

    #[test]
    fn test_reader_read_exact_across_chunks() {
        let mut r = FrameReader::new([vec![0x00, 0x18], vec![0x00], vec![0x50, 0xff]]);
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x18, 0x00, 0x50]);
        assert_eq!(r.remains(), 1);
        assert_eq!(r.fetch_byte().unwrap(), 0xff);
        assert!(r.completed());
    }

    #[test]
    fn test_reader_read_exact_partial_chunk_kept() {
        let mut r = FrameReader::new([vec![1, 2, 3, 4]]);
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(r.buffered(), Some(vec![3, 4]));
    }

    #[test]
    fn test_reader_short_payload() {
        let mut r = FrameReader::new([vec![1]]);
        let mut buf = [0u8; 2];
        assert!(matches!(
            r.read_exact(&mut buf),
            Err(FrameError::UnexpectedEnd)
        ));
    }

    #[test]
    fn test_reader_empty_chunks_skipped() {
        let mut r = FrameReader::new([vec![], vec![9], vec![]]);
        assert_eq!(r.remains(), 1);
        assert_eq!(r.fetch_byte().unwrap(), 9);
        assert!(r.completed());
    }
}
