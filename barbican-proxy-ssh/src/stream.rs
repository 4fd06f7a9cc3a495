//! The framing seam between a session and the outer stream multiplexer.
//!
//! The multiplexer tags every outbound frame with a per-session header; the
//! session reserves `header_size()` bytes at the front of each frame buffer
//! and writes payload after them.

use std::future::Future;
use std::io;

/// Out-of-band signals a session can raise on its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Terminal marker: nothing further will be sent for this session.
    Close,
}

/// Narrow contract with the outer stream multiplexer.
///
/// `send_manual` receives the whole frame buffer; the first `header_size()`
/// bytes are the header region the multiplexer fills in before emission.
pub trait StreamResponder: Send + Sync + 'static {
    /// Byte prefix reserved for the multiplexer in every frame buffer.
    fn header_size(&self) -> usize;

    /// Emit one frame. `frame[..header_size()]` is populated by the
    /// multiplexer; the rest is the payload as written by the session.
    fn send_manual(
        &self,
        marker: u8,
        frame: &mut [u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Emit an out-of-band signal for this session.
    fn signal(&self, signal: ControlSignal) -> impl Future<Output = io::Result<()>> + Send;
}
