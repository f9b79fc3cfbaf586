//! Single-pin model: discovered capabilities, current mode/value/state, and
//! the state-change notification chain.
//!
//! A `Pin` is a cheap-clone handle over shared state. The session owns the
//! authoritative collection and is the only component that mutates mode and
//! value; debounce filters and encoder decoders hold clones purely to observe
//! state changes.

use crate::chain::{CallChain, CallId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Pin operating mode, as discovered from the capability map.
///
/// Byte values match the wire protocol exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PinMode {
    DigitalIn = 0,
    DigitalOut = 1,
    AnalogIn = 2,
    Pwm = 3,
    Servo = 4,
    Shift = 5,
    I2c = 6,
    OneWire = 7,
    Stepper = 8,
    Encoder = 9,
    Serial = 10,
    PullupIn = 11,
}

impl PinMode {
    pub fn from_byte(byte: u8) -> Option<PinMode> {
        use PinMode::*;
        Some(match byte {
            0 => DigitalIn,
            1 => DigitalOut,
            2 => AnalogIn,
            3 => Pwm,
            4 => Servo,
            5 => Shift,
            6 => I2c,
            7 => OneWire,
            8 => Stepper,
            9 => Encoder,
            10 => Serial,
            11 => PullupIn,
            _ => return None,
        })
    }

    /// Any mode in which the device pushes state to the host.
    pub fn is_input(self) -> bool {
        matches!(self, PinMode::DigitalIn | PinMode::PullupIn | PinMode::AnalogIn)
    }

    pub fn is_digital_input(self) -> bool {
        matches!(self, PinMode::DigitalIn | PinMode::PullupIn)
    }

    pub fn is_output(self) -> bool {
        matches!(self, PinMode::DigitalOut | PinMode::Pwm)
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinMode::DigitalIn => "digital_in",
            PinMode::DigitalOut => "digital_out",
            PinMode::AnalogIn => "analog_in",
            PinMode::Pwm => "pwm",
            PinMode::Servo => "servo",
            PinMode::Shift => "shift",
            PinMode::I2c => "i2c",
            PinMode::OneWire => "onewire",
            PinMode::Stepper => "stepper",
            PinMode::Encoder => "encoder",
            PinMode::Serial => "serial",
            PinMode::PullupIn => "pullup_in",
        };
        f.write_str(name)
    }
}

/// Mutable per-pin fields, serialized behind one lock.
struct Live {
    mode: PinMode,
    value: i32,
    state: i32,
    reporting: bool,
}

struct Shared {
    digital: usize,
    analog: Option<usize>,
    modes: BTreeSet<PinMode>,
    resolutions: BTreeMap<PinMode, u8>,
    live: Mutex<Live>,
    changed: CallChain<i32>,
}

/// Handle to one discovered pin.
#[derive(Clone)]
pub struct Pin {
    shared: Arc<Shared>,
}

impl Pin {
    pub(crate) fn new(
        digital: usize,
        analog: Option<usize>,
        modes: BTreeSet<PinMode>,
        resolutions: BTreeMap<PinMode, u8>,
    ) -> Self {
        // the device overwrites this during the state query; until then any
        // supported mode will do
        let mode = modes.iter().next().copied().unwrap_or(PinMode::DigitalIn);
        Self {
            shared: Arc::new(Shared {
                digital,
                analog,
                modes,
                resolutions,
                live: Mutex::new(Live {
                    mode,
                    value: 0,
                    state: 0,
                    reporting: false,
                }),
                changed: CallChain::new(),
            }),
        }
    }

    /// Digital position, stable for the session's lifetime.
    pub fn digital(&self) -> usize {
        self.shared.digital
    }

    /// Analog index, present iff the pin supports analog input.
    pub fn analog(&self) -> Option<usize> {
        self.shared.analog
    }

    /// Supported modes in ascending byte order.
    pub fn modes(&self) -> Vec<PinMode> {
        self.shared.modes.iter().copied().collect()
    }

    pub fn supports(&self, mode: PinMode) -> bool {
        self.shared.modes.contains(&mode)
    }

    /// Resolution in bits for a supported mode.
    pub fn resolution(&self, mode: PinMode) -> Option<u8> {
        self.shared.resolutions.get(&mode).copied()
    }

    /// Resolution in bits for the current mode.
    pub fn res(&self) -> u8 {
        self.resolution(self.mode()).unwrap_or(0)
    }

    pub fn mode(&self) -> PinMode {
        self.shared.live.lock().mode
    }

    /// Last value written to the pin; meaningful only in output modes.
    pub fn value(&self) -> i32 {
        self.shared.live.lock().value
    }

    /// Last externally observed state; meaningful only in input modes.
    pub fn state(&self) -> i32 {
        self.shared.live.lock().state
    }

    /// Subscribe to state changes. The callback receives the new state.
    pub fn on_state_changed(&self, call: impl Fn(&i32) + Send + Sync + 'static) -> CallId {
        self.shared.changed.subscribe(call)
    }

    /// Remove a state-change callback.
    pub fn remove_call(&self, id: CallId) -> bool {
        self.shared.changed.unsubscribe(id)
    }

    pub(crate) fn record_mode(&self, mode: PinMode) {
        self.shared.live.lock().mode = mode;
    }

    pub(crate) fn record_value(&self, value: i32) {
        self.shared.live.lock().value = value;
    }

    pub(crate) fn reporting(&self) -> bool {
        self.shared.live.lock().reporting
    }

    pub(crate) fn record_reporting(&self, on: bool) {
        self.shared.live.lock().reporting = on;
    }

    /// Update the externally observed state and fire the notification chain,
    /// but only when the state actually changed.
    pub(crate) fn change_state(&self, state: i32) {
        {
            let mut live = self.shared.live.lock();
            if live.state == state {
                return;
            }
            live.state = state;
        }
        self.shared.changed.emit(&state);
    }

    #[cfg(test)]
    pub(crate) fn state_calls(&self) -> usize {
        self.shared.changed.len()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("digital", &self.shared.digital)
            .field("analog", &self.shared.analog)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_pin(digital: usize, mode: PinMode) -> Pin {
    let mut modes = BTreeSet::new();
    modes.insert(mode);
    let pin = Pin::new(digital, None, modes, BTreeMap::new());
    pin.record_mode(mode);
    pin
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_change_state_is_idempotent() {
        let pin = test_pin(3, PinMode::DigitalIn);
        let fired = Arc::new(Mutex::new(Vec::new()));
        {
            let fired = fired.clone();
            pin.on_state_changed(move |&s| fired.lock().push(s));
        }

        pin.change_state(1);
        pin.change_state(1);
        assert_eq!(*fired.lock(), vec![1]);

        pin.change_state(0);
        pin.change_state(0);
        assert_eq!(*fired.lock(), vec![1, 0]);
    }

    #[test]
    fn test_callbacks_may_read_state() {
        let pin = test_pin(0, PinMode::DigitalIn);
        let seen = Arc::new(Mutex::new(-1));
        {
            let seen = seen.clone();
            let watched = pin.clone();
            pin.on_state_changed(move |_| *seen.lock() = watched.state());
        }
        pin.change_state(7);
        assert_eq!(*seen.lock(), 7);
    }

    #[test]
    fn test_supports_and_resolution() {
        let mut modes = BTreeSet::new();
        modes.insert(PinMode::DigitalIn);
        modes.insert(PinMode::Pwm);
        let mut res = BTreeMap::new();
        res.insert(PinMode::DigitalIn, 1);
        res.insert(PinMode::Pwm, 8);

        let pin = Pin::new(5, None, modes, res);
        assert!(pin.supports(PinMode::Pwm));
        assert!(!pin.supports(PinMode::AnalogIn));
        assert_eq!(pin.resolution(PinMode::Pwm), Some(8));
        pin.record_mode(PinMode::Pwm);
        assert_eq!(pin.res(), 8);
    }

    #[test]
    fn test_remove_call() {
        let pin = test_pin(1, PinMode::DigitalIn);
        let id = pin.on_state_changed(|_| {});
        assert_eq!(pin.state_calls(), 1);
        assert!(pin.remove_call(id));
        assert_eq!(pin.state_calls(), 0);
    }
}
