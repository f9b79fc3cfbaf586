//! Serial port transport built on the `serialport` crate.
//!
//! The port's blocking read side runs on a dedicated thread that forwards raw
//! chunks into an async channel; writes go straight to a cloned port handle.

use crate::error::{Error, Result};
use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// Some firmwares drop bytes when frames arrive back to back; the reference
// implementation paces writes the same way.
const WRITE_PACING: Duration = Duration::from_millis(4);

const READ_POLL: Duration = Duration::from_millis(50);

/// Serial line parameters. Defaults to Firmata's 57600-8N1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`.
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// "none", "odd" or "even".
    pub parity: String,
    pub stop_bits: u8,
    /// "none", "software" or "hardware".
    pub flow_control: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: 57_600,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
            flow_control: "none".to_string(),
        }
    }
}

impl SerialSettings {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    fn data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn parity(&self) -> Parity {
        match self.parity.as_str() {
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            _ => Parity::None,
        }
    }

    fn stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn flow_control(&self) -> FlowControl {
        match self.flow_control.as_str() {
            "software" => FlowControl::Software,
            "hardware" => FlowControl::Hardware,
            _ => FlowControl::None,
        }
    }
}

/// Transport over a local serial device.
pub struct SerialTransport {
    writer: Box<dyn SerialPort>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open the device and start the reader thread.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let port = serialport::new(&settings.device, settings.baud_rate)
            .data_bits(settings.data_bits())
            .parity(settings.parity())
            .stop_bits(settings.stop_bits())
            .flow_control(settings.flow_control())
            .timeout(READ_POLL)
            .open()?;
        let writer = port.try_clone()?;
        debug!(device = %settings.device, baud = settings.baud_rate, "serial port open");

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let mut reader = port;
        std::thread::Builder::new()
            .name("firmata-serial-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !flag.load(Ordering::Relaxed) {
                    match reader.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!("serial read failed: {e}");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            writer,
            rx,
            shutdown,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        tokio::time::sleep(WRITE_PACING).await;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(Error::Closed)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = SerialSettings::new("/dev/ttyACM0");
        assert_eq!(settings.baud_rate, 57_600);
        assert_eq!(settings.data_bits(), DataBits::Eight);
        assert_eq!(settings.parity(), Parity::None);
        assert_eq!(settings.stop_bits(), StopBits::One);
        assert_eq!(settings.flow_control(), FlowControl::None);
    }

    #[test]
    fn test_settings_mapping() {
        let settings = SerialSettings {
            device: "COM3".to_string(),
            baud_rate: 115_200,
            data_bits: 7,
            parity: "even".to_string(),
            stop_bits: 2,
            flow_control: "hardware".to_string(),
        };
        assert_eq!(settings.data_bits(), DataBits::Seven);
        assert_eq!(settings.parity(), Parity::Even);
        assert_eq!(settings.stop_bits(), StopBits::Two);
        assert_eq!(settings.flow_control(), FlowControl::Hardware);
    }
}
