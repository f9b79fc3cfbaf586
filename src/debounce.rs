//! Timer-driven suppression of transient pin state flips.
//!
//! Publishes the trailing state only after it has been stable for the
//! configured delay: every raw change re-arms a single timer, replacing (and
//! cancelling) any previously armed one. When the timer survives the quiet
//! period, the pin's state at expiry is compared against the last published
//! value and published only when different, so bursts collapse to at most one
//! publish per quiet period.

use crate::chain::CallId;
use crate::error::{Error, Result};
use crate::pin::Pin;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default quiet period.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(5);

/// Handle to one debounced subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DebounceId(u64);

type Timer = Arc<Mutex<Option<JoinHandle<()>>>>;

struct Entry {
    pin: Pin,
    sub: CallId,
    timer: Timer,
}

impl Drop for Entry {
    fn drop(&mut self) {
        // cancel the timer before unsubscribing so no expiry can fire into a
        // torn-down entry
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        self.pin.remove_call(self.sub);
    }
}

/// Registry of debounced pin subscriptions sharing one delay.
pub struct Debounce {
    delay: Duration,
    entries: Mutex<BTreeMap<u64, Entry>>,
    next: AtomicU64,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            entries: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0),
        }
    }

    /// Watch a digital input pin, invoking `call` with each debounced state.
    ///
    /// Must be called from within a tokio runtime; timers are spawned tasks.
    pub fn on_state_changed(
        &self,
        pin: &Pin,
        call: impl Fn(i32) + Send + Sync + 'static,
    ) -> Result<DebounceId> {
        if !pin.mode().is_digital_input() {
            return Err(Error::InvalidMode {
                pin: pin.digital(),
                mode: pin.mode(),
            });
        }

        let timer: Timer = Arc::new(Mutex::new(None));
        let published = Arc::new(Mutex::new(pin.state()));
        let call = Arc::new(call);
        let delay = self.delay;

        let sub = {
            let timer = timer.clone();
            let watched = pin.clone();
            pin.on_state_changed(move |_| {
                let mut slot = timer.lock();
                if let Some(previous) = slot.take() {
                    previous.abort();
                }
                let pin = watched.clone();
                let published = published.clone();
                let call = call.clone();
                *slot = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // compare against the state at expiry, not at arm time
                    let state = pin.state();
                    let publish = {
                        let mut published = published.lock();
                        if state != *published {
                            *published = state;
                            true
                        } else {
                            false
                        }
                    };
                    if publish {
                        call(state);
                    }
                }));
            })
        };

        let id = DebounceId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id.0,
            Entry {
                pin: pin.clone(),
                sub,
                timer,
            },
        );
        Ok(id)
    }

    /// Invoke `call` whenever the debounced state settles high.
    pub fn on_state_high(
        &self,
        pin: &Pin,
        call: impl Fn() + Send + Sync + 'static,
    ) -> Result<DebounceId> {
        self.on_state_changed(pin, move |state| {
            if state != 0 {
                call();
            }
        })
    }

    /// Invoke `call` whenever the debounced state settles low.
    pub fn on_state_low(
        &self,
        pin: &Pin,
        call: impl Fn() + Send + Sync + 'static,
    ) -> Result<DebounceId> {
        self.on_state_changed(pin, move |state| {
            if state == 0 {
                call();
            }
        })
    }

    /// Remove a subscription, cancelling any in-flight timer.
    pub fn remove(&self, id: DebounceId) -> bool {
        self.entries.lock().remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::{test_pin, PinMode};
    use tokio::sync::mpsc;
    use tokio::time::{advance, timeout, Instant};

    fn watched(
        deb: &Debounce,
        pin: &Pin,
    ) -> (DebounceId, mpsc::UnboundedReceiver<(Instant, i32)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = deb
            .on_state_changed(pin, move |state| {
                let _ = tx.send((Instant::now(), state));
            })
            .unwrap();
        (id, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_trailing_publish() {
        let pin = test_pin(2, PinMode::DigitalIn);
        let deb = Debounce::new(Duration::from_millis(50));
        let (_id, mut rx) = watched(&deb, &pin);
        let start = Instant::now();

        // flips at t=0, 10, 20 settling at 1
        pin.change_state(1);
        advance(Duration::from_millis(10)).await;
        pin.change_state(0);
        advance(Duration::from_millis(10)).await;
        pin.change_state(1);

        let (at, state) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("debounced publish")
            .unwrap();
        assert_eq!(state, 1);
        // last flip at t=20 plus the 50ms quiet period
        assert_eq!(at - start, Duration::from_millis(70));

        advance(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "only one publish per quiet period");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settling_back_to_published_state_is_silent() {
        let pin = test_pin(0, PinMode::DigitalIn);
        let deb = Debounce::new(Duration::from_millis(50));
        let (_id, mut rx) = watched(&deb, &pin);

        // a pulse shorter than the quiet period returns to the published state
        pin.change_state(1);
        advance(Duration::from_millis(10)).await;
        pin.change_state(0);
        advance(Duration::from_millis(200)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_cancels_timer_and_unsubscribes() {
        let pin = test_pin(1, PinMode::PullupIn);
        let deb = Debounce::new(Duration::from_millis(50));
        let (id, mut rx) = watched(&deb, &pin);

        pin.change_state(1);
        assert!(deb.remove(id));
        assert_eq!(pin.state_calls(), 0);

        advance(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "cancelled timer must not publish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_drop_detaches_from_pin() {
        let pin = test_pin(4, PinMode::DigitalIn);
        let deb = Debounce::default();
        let _ = deb.on_state_changed(&pin, |_| {}).unwrap();
        let _ = deb.on_state_low(&pin, || {}).unwrap();
        assert_eq!(pin.state_calls(), 2);
        drop(deb);
        assert_eq!(pin.state_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejects_non_input_pin() {
        let pin = test_pin(5, PinMode::DigitalOut);
        let deb = Debounce::default();
        assert!(matches!(
            deb.on_state_changed(&pin, |_| {}),
            Err(Error::InvalidMode { pin: 5, .. })
        ));
    }
}
