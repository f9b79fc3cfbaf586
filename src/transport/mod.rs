//! Transport abstraction between the session and the physical link.
//!
//! The session only ever sees raw framed bytes going out and raw byte chunks
//! coming in; framing and dispatch live above this seam, the OS serial plumbing
//! below it.

pub mod serial;

pub use serial::{SerialSettings, SerialTransport};

use crate::error::Result;
use async_trait::async_trait;

/// Raw byte link to the device.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one framed message to the device.
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Receive the next chunk of raw bytes from the device.
    ///
    /// Chunks carry no framing guarantees; a chunk may hold a partial message
    /// or several messages. Must be cancel-safe: a future dropped before
    /// completion loses no data.
    async fn recv(&mut self) -> Result<Vec<u8>>;
}
