//! Host-side client for the Firmata device-control protocol.
//!
//! Talks to a microcontroller-class peripheral over a serial line: discovers
//! its capabilities, drives digital/analog pins, and delivers state changes
//! through callback chains. Two signal-conditioning layers sit on top of pin
//! state changes: a [`Debounce`] filter and a quadrature [`Encoder`] decoder.
//!
//! ```no_run
//! use firmata_client::{Control, Options, PinMode, SerialSettings, SerialTransport};
//!
//! # async fn demo() -> firmata_client::Result<()> {
//! let transport = SerialTransport::open(&SerialSettings::new("/dev/ttyACM0"))?;
//! let control = Control::open(transport, Options::default()).await?;
//!
//! println!("connected to {}", control.firmware());
//! control.set_mode(13, PinMode::DigitalOut)?;
//! control.set_value(13, 1)?;
//!
//! control.set_mode(2, PinMode::DigitalIn)?;
//! control.pin(2)?.on_state_changed(|&state| {
//!     println!("pin 2 -> {state}");
//! });
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod control;
pub mod debounce;
pub mod encoder;
mod error;
pub mod message;
pub mod pin;
pub mod pins;
pub mod transport;

pub use chain::{CallChain, CallId};
pub use control::{Control, Firmware, Options, Protocol};
pub use debounce::{Debounce, DebounceId};
pub use encoder::Encoder;
pub use error::{Error, Result};
pub use message::{MsgId, Payload};
pub use pin::{Pin, PinMode};
pub use pins::Pins;
pub use transport::{SerialSettings, SerialTransport, Transport};
