//! Ordered pin collection with digital-port grouping and analog-index lookup.
//!
//! Membership is fixed once discovery completes; only per-pin live fields
//! change afterwards.

use crate::error::{Error, Result};
use crate::pin::{Pin, PinMode};

/// Number of pins per digital port.
pub const PINS_PER_PORT: usize = 8;

/// Split a digital position into (port index, bit within port).
pub(crate) fn port_of(pos: usize) -> (usize, usize) {
    (pos / PINS_PER_PORT, pos % PINS_PER_PORT)
}

/// All pins discovered on the device, ordered by digital position.
pub struct Pins {
    all: Vec<Pin>,
    // analog index -> digital position
    analogs: Vec<Option<usize>>,
}

impl Pins {
    pub(crate) fn new(all: Vec<Pin>) -> Self {
        let max = all.iter().filter_map(|p| p.analog()).max();
        let mut analogs = vec![None; max.map_or(0, |m| m + 1)];
        for pin in &all {
            if let Some(idx) = pin.analog() {
                analogs[idx] = Some(pin.digital());
            }
        }
        Self { all, analogs }
    }

    /// Total number of pins.
    pub fn count(&self) -> usize {
        self.all.len()
    }

    /// Number of pins supporting the given mode.
    pub fn count_mode(&self, mode: PinMode) -> usize {
        self.all.iter().filter(|p| p.supports(mode)).count()
    }

    /// Pin by digital position.
    pub fn get(&self, pos: usize) -> Result<&Pin> {
        self.all
            .get(pos)
            .ok_or_else(|| Error::OutOfRange(format!("digital position {pos}")))
    }

    /// Pin by analog index.
    pub fn get_analog(&self, index: usize) -> Result<&Pin> {
        self.analogs
            .get(index)
            .copied()
            .flatten()
            .and_then(|pos| self.all.get(pos))
            .ok_or_else(|| Error::OutOfRange(format!("analog index {index}")))
    }

    /// The `nth` pin (in digital order) that supports `mode`.
    pub fn get_mode(&self, mode: PinMode, nth: usize) -> Result<&Pin> {
        self.all
            .iter()
            .filter(|p| p.supports(mode))
            .nth(nth)
            .ok_or_else(|| Error::OutOfRange(format!("pin {nth} supporting {mode}")))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pin> {
        self.all.iter()
    }
}

impl<'a> IntoIterator for &'a Pins {
    type Item = &'a Pin;
    type IntoIter = std::slice::Iter<'a, Pin>;

    fn into_iter(self) -> Self::IntoIter {
        self.all.iter()
    }
}

impl std::fmt::Debug for Pins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pins").field("count", &self.all.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn make_pins() -> Pins {
        // pins 0..=5 digital only, pins 6 and 7 also analog A0/A1
        let mut all = Vec::new();
        for pos in 0..8 {
            let mut modes = BTreeSet::new();
            modes.insert(PinMode::DigitalIn);
            modes.insert(PinMode::DigitalOut);
            let analog = match pos {
                6 => Some(0),
                7 => Some(1),
                _ => None,
            };
            if analog.is_some() {
                modes.insert(PinMode::AnalogIn);
            }
            all.push(Pin::new(pos, analog, modes, BTreeMap::new()));
        }
        Pins::new(all)
    }

    #[test]
    fn test_port_math() {
        assert_eq!(port_of(0), (0, 0));
        assert_eq!(port_of(7), (0, 7));
        assert_eq!(port_of(8), (1, 0));
        assert_eq!(port_of(13), (1, 5));
    }

    #[test]
    fn test_get_by_digital_position() {
        let pins = make_pins();
        assert_eq!(pins.get(3).unwrap().digital(), 3);
        assert!(matches!(pins.get(8), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_get_by_analog_index() {
        let pins = make_pins();
        assert_eq!(pins.get_analog(0).unwrap().digital(), 6);
        assert_eq!(pins.get_analog(1).unwrap().digital(), 7);
        assert!(matches!(pins.get_analog(2), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_get_by_mode() {
        let pins = make_pins();
        assert_eq!(pins.get_mode(PinMode::AnalogIn, 0).unwrap().digital(), 6);
        assert_eq!(pins.get_mode(PinMode::AnalogIn, 1).unwrap().digital(), 7);
        assert!(pins.get_mode(PinMode::AnalogIn, 2).is_err());
        assert_eq!(pins.get_mode(PinMode::DigitalOut, 4).unwrap().digital(), 4);
    }

    #[test]
    fn test_counts() {
        let pins = make_pins();
        assert_eq!(pins.count(), 8);
        assert_eq!(pins.count_mode(PinMode::AnalogIn), 2);
        assert_eq!(pins.count_mode(PinMode::DigitalIn), 8);
    }
}
