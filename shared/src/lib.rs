//! Shared protocol definitions for the Barbican SSH session proxy.
//!
//! This crate provides:
//! - Frame marker constants exchanged with the browser-side client
//! - Bootup payload codecs (length-prefixed strings, address records)
//! - The chunked frame-payload reader used by the session dispatcher

// L-1: Relax strict clippy lints in test code where unwrap/expect/panic are idiomatic
#![cfg_attr(test, allow(
    clippy::unwrap_used, clippy::expect_used, clippy::panic,
    clippy::print_stdout, clippy::print_stderr
))]

pub mod codec;
pub mod frame;

pub use codec::Address;
pub use frame::{AuthMethod, ClientSignal, FrameReader, ServerSignal, StreamErrorCode};
