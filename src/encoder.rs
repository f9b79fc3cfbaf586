//! Quadrature rotary-encoder decoding from two digital input pins.
//!
//! Pin 1 is the clock: its falling edge latches a pending direction from
//! pin 2's current phase, and its rising edge confirms it. Only a consistent
//! two-phase transition emits a rotation event; any mismatch resets the
//! accumulator to neutral, so bounced or interrupted transitions never produce
//! spurious detents.

use crate::chain::{CallChain, CallId};
use crate::error::{Error, Result};
use crate::pin::Pin;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Neutral,
    Cw,
    Ccw,
}

struct Shared {
    pin2: Pin,
    step: Mutex<Step>,
    count: Mutex<i64>,
    rotate: CallChain<i64>,
    cw: CallChain<()>,
    ccw: CallChain<()>,
}

impl Shared {
    fn emit(&self, delta: i64) {
        let count = {
            let mut count = self.count.lock();
            *count += delta;
            *count
        };
        self.rotate.emit(&count);
        if delta > 0 {
            self.cw.emit(&());
        } else {
            self.ccw.emit(&());
        }
    }

    fn clocked(&self, state: i32) {
        if state != 0 {
            let direction = if self.pin2.state() != 0 {
                Step::Cw
            } else {
                Step::Ccw
            };
            let confirmed = {
                let mut step = self.step.lock();
                let confirmed = *step == direction;
                *step = Step::Neutral;
                confirmed
            };
            if confirmed {
                match direction {
                    Step::Cw => self.emit(1),
                    Step::Ccw => self.emit(-1),
                    Step::Neutral => {}
                }
            }
        } else {
            *self.step.lock() = if self.pin2.state() != 0 {
                Step::Ccw
            } else {
                Step::Cw
            };
        }
    }
}

/// Rotary encoder decoder over two digital input pins.
pub struct Encoder {
    pin1: Pin,
    sub: CallId,
    shared: Arc<Shared>,
}

impl Encoder {
    /// Attach to `pin1` (clock) and `pin2` (direction). Both pins must be in
    /// a digital input mode.
    pub fn new(pin1: &Pin, pin2: &Pin) -> Result<Encoder> {
        for pin in [pin1, pin2] {
            if !pin.mode().is_digital_input() {
                return Err(Error::InvalidMode {
                    pin: pin.digital(),
                    mode: pin.mode(),
                });
            }
        }

        let shared = Arc::new(Shared {
            pin2: pin2.clone(),
            step: Mutex::new(Step::Neutral),
            count: Mutex::new(0),
            rotate: CallChain::new(),
            cw: CallChain::new(),
            ccw: CallChain::new(),
        });

        let sub = {
            let shared = shared.clone();
            pin1.on_state_changed(move |&state| shared.clocked(state))
        };

        Ok(Encoder {
            pin1: pin1.clone(),
            sub,
            shared,
        })
    }

    /// Accumulated detent count: +1 per clockwise, -1 per counter-clockwise.
    pub fn count(&self) -> i64 {
        *self.shared.count.lock()
    }

    /// Subscribe to count changes; the callback receives the new count.
    pub fn on_rotate(&self, call: impl Fn(&i64) + Send + Sync + 'static) -> CallId {
        self.shared.rotate.subscribe(call)
    }

    /// Subscribe to clockwise detents.
    pub fn on_rotate_cw(&self, call: impl Fn() + Send + Sync + 'static) -> CallId {
        self.shared.cw.subscribe(move |_: &()| call())
    }

    /// Subscribe to counter-clockwise detents.
    pub fn on_rotate_ccw(&self, call: impl Fn() + Send + Sync + 'static) -> CallId {
        self.shared.ccw.subscribe(move |_: &()| call())
    }

    /// Remove a callback from whichever rotation chain holds it.
    pub fn remove_call(&self, id: CallId) -> bool {
        self.shared.rotate.unsubscribe(id)
            || self.shared.cw.unsubscribe(id)
            || self.shared.ccw.unsubscribe(id)
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.pin1.remove_call(self.sub);
    }
}
