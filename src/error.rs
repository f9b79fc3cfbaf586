//! Error taxonomy for the client.

use crate::message::MsgId;
use crate::pin::PinMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Buffered bytes could not be interpreted as a protocol message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The pin's discovered capabilities do not include the requested mode.
    #[error("pin {pin} does not support mode {mode}")]
    UnsupportedMode { pin: usize, mode: PinMode },

    /// The operation is not valid for the pin's current mode.
    #[error("operation not valid for pin {pin} in mode {mode}")]
    InvalidMode { pin: usize, mode: PinMode },

    /// No matching reply arrived within the deadline.
    #[error("timed out waiting for reply {0:?}")]
    Timeout(MsgId),

    /// Lookup of a pin by digital/analog/mode-relative position failed.
    #[error("pin not found: {0}")]
    OutOfRange(String),

    /// The transport is gone.
    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
