//! Device session: discovery, pin intents, report policy, and unsolicited
//! message handling.
//!
//! `Control::open` drives the discovery handshake (protocol version, firmware
//! descriptor, capability map, analog mapping, per-pin state), applies the
//! initial report policy, and then listens for unsolicited traffic for the
//! rest of its lifetime. All pin mutation funnels through the session; pins
//! themselves only carry state and notifications.


use crate::chain::{CallChain, CallId};
use crate::error::{Error, Result};
use crate::message::{self, Decoder, MsgId, Payload};
use crate::pin::{Pin, PinMode};
use crate::pins::{port_of, Pins};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Protocol version reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Firmware descriptor reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.name, self.major, self.minor)
    }
}

/// Session options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Deadline for each query's reply. Discovery-phase timeouts fail
    /// construction.
    pub reply_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(3),
        }
    }
}

/// Wire half of the session: outbound frames plus the inbound message chain.
/// Usable before discovery completes.
struct Link {
    out: mpsc::UnboundedSender<Vec<u8>>,
    router: Arc<CallChain<(MsgId, Payload)>>,
    timeout: Duration,
}

impl Link {
    fn send(&self, id: MsgId, data: &[u8]) -> Result<()> {
        trace!(?id, len = data.len(), "send");
        self.out
            .send(message::frame(id, data))
            .map_err(|_| Error::Closed)
    }

    /// Register a transient subscription funnelling the first `reply` into a
    /// oneshot channel.
    fn expect(&self, reply: MsgId) -> (CallId, oneshot::Receiver<Payload>) {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let sub = self.router.subscribe(move |(id, data): &(MsgId, Payload)| {
            if *id == reply {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(data.clone());
                }
            }
        });
        (sub, rx)
    }

    /// Block the caller's logical flow until `reply` arrives or the deadline
    /// elapses. The transient subscription is removed on both paths.
    async fn wait_with(&self, reply: MsgId, timeout: Duration) -> Result<Payload> {
        let (sub, rx) = self.expect(reply);
        self.settle(sub, rx, reply, timeout).await
    }

    async fn settle(
        &self,
        sub: CallId,
        rx: oneshot::Receiver<Payload>,
        reply: MsgId,
        timeout: Duration,
    ) -> Result<Payload> {
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.router.unsubscribe(sub);
        match outcome {
            Ok(Ok(data)) => Ok(data),
            _ => Err(Error::Timeout(reply)),
        }
    }

    /// Send a query and wait for its reply. The subscription must be in place
    /// before the frame goes out: the pump may deliver the reply from another
    /// worker thread, and the router drops messages with no subscribers.
    async fn query(&self, id: MsgId, data: &[u8], reply: MsgId) -> Result<Payload> {
        let (sub, rx) = self.expect(reply);
        if let Err(e) = self.send(id, data) {
            self.router.unsubscribe(sub);
            return Err(e);
        }
        self.settle(sub, rx, reply, self.timeout).await
    }
}

/// State reachable from the unsolicited-message subscription.
struct SessionShared {
    pins: Pins,
    text: Mutex<String>,
    text_changed: CallChain<String>,
}

/// Session with one attached device.
pub struct Control {
    link: Link,
    shared: Arc<SessionShared>,
    protocol: Protocol,
    firmware: Firmware,
    // monitored bitmask per digital port; a report toggle goes on the wire
    // only when a port's aggregate flips between zero and nonzero
    ports: Mutex<HashMap<usize, u8>>,
    sub: CallId,
    pump: tokio::task::JoinHandle<()>,
}

impl Control {
    /// Open a session: spawn the transport pump, run discovery, apply the
    /// initial report policy and register the unsolicited-message handler.
    ///
    /// Fails atomically: on any discovery error the pump is torn down and no
    /// usable session is returned.
    pub async fn open<T: Transport>(transport: T, options: Options) -> Result<Control> {
        let router = Arc::new(CallChain::new());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(transport, out_rx, router.clone()));
        let link = Link {
            out: out_tx,
            router,
            timeout: options.reply_timeout,
        };

        let (protocol, firmware, shared) = match Self::discover(&link).await {
            Ok(parts) => parts,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };

        let sub = {
            let shared = shared.clone();
            link.router
                .subscribe(move |(id, data): &(MsgId, Payload)| on_read(&shared, *id, data))
        };

        let control = Control {
            link,
            shared,
            protocol,
            firmware,
            ports: Mutex::new(HashMap::new()),
            sub,
            pump,
        };
        // dropping `control` on failure tears the pump down with it
        control.apply_report_policy()?;

        info!(
            protocol = %control.protocol,
            firmware = %control.firmware,
            pins = control.shared.pins.count(),
            "discovery complete"
        );
        Ok(control)
    }

    async fn discover(link: &Link) -> Result<(Protocol, Firmware, Arc<SessionShared>)> {
        let protocol = query_protocol(link).await?;
        let firmware = query_firmware(link).await?;
        debug!(%protocol, %firmware, "device identified");

        let caps = query_capabilities(link).await?;
        let analogs = query_analog_mapping(link, caps.len()).await?;

        let pins: Vec<Pin> = caps
            .into_iter()
            .enumerate()
            .map(|(pos, (modes, resolutions))| {
                Pin::new(pos, analogs.get(pos).copied().flatten(), modes, resolutions)
            })
            .collect();
        let pins = Pins::new(pins);

        for pin in &pins {
            query_state(link, pin).await?;
        }

        let shared = Arc::new(SessionShared {
            pins,
            text: Mutex::new(String::new()),
            text_changed: CallChain::new(),
        });

        Ok((protocol, firmware, shared))
    }

    /// Protocol version discovered at construction.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Firmware descriptor discovered at construction.
    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// The discovered pin collection.
    pub fn pins(&self) -> &Pins {
        &self.shared.pins
    }

    /// Pin by digital position.
    pub fn pin(&self, pos: usize) -> Result<&Pin> {
        self.shared.pins.get(pos)
    }

    /// Last free-text string pushed by the device.
    pub fn text(&self) -> String {
        self.shared.text.lock().clone()
    }

    /// Subscribe to device text changes. Fires only when the text differs
    /// from the previously stored one.
    pub fn on_text(&self, call: impl Fn(&String) + Send + Sync + 'static) -> CallId {
        self.shared.text_changed.subscribe(call)
    }

    pub fn remove_text_call(&self, id: CallId) -> bool {
        self.shared.text_changed.unsubscribe(id)
    }

    /// Subscribe to every decoded inbound message.
    pub fn on_message(&self, call: impl Fn(&(MsgId, Payload)) + Send + Sync + 'static) -> CallId {
        self.link.router.subscribe(call)
    }

    pub fn remove_message_call(&self, id: CallId) -> bool {
        self.link.router.unsubscribe(id)
    }

    /// Switch a pin to a discovered mode.
    ///
    /// Leaving a reported input mode disables its reporting first; entering an
    /// input mode enables reporting after the mode message goes out. The whole
    /// sequence runs synchronously, so no caller observes an intermediate
    /// state.
    pub fn set_mode(&self, pos: usize, mode: PinMode) -> Result<()> {
        let pin = self.shared.pins.get(pos)?.clone();
        if !pin.supports(mode) {
            return Err(Error::UnsupportedMode { pin: pos, mode });
        }

        let old = pin.mode();
        if old.is_input() && pin.reporting() {
            self.report_pin(&pin, false)?;
        }
        pin.record_mode(mode);
        self.link.send(message::PIN_MODE, &[pos as u8, mode as u8])?;
        if mode.is_input() {
            self.report_pin(&pin, true)?;
        }
        Ok(())
    }

    /// Drive an output pin.
    ///
    /// Digital outputs coerce the value to a boolean; PWM outputs take the
    /// full range, switching to the extended-analog form when the analog index
    /// or value exceeds the inline message's reach.
    pub fn set_value(&self, pos: usize, value: i32) -> Result<()> {
        let pin = self.shared.pins.get(pos)?;
        match pin.mode() {
            PinMode::DigitalOut => {
                let v = (value != 0) as u8;
                pin.record_value(v as i32);
                self.link.send(message::DIGITAL_VALUE, &[pos as u8, v])
            }
            PinMode::Pwm => {
                pin.record_value(value);
                self.send_analog_value(pin, value)
            }
            mode => Err(Error::InvalidMode { pin: pos, mode }),
        }
    }

    fn send_analog_value(&self, pin: &Pin, value: i32) -> Result<()> {
        let idx = pin.analog().ok_or_else(|| {
            Error::OutOfRange(format!("pin {} has no analog index", pin.digital()))
        })?;
        if idx <= 15 && value <= 16383 {
            self.link.send(message::analog_value(idx), &message::to_data(value))
        } else {
            let mut data = vec![idx as u8];
            data.extend(message::to_data(value));
            self.link.send(message::EXTENDED_ANALOG, &data)
        }
    }

    /// Ask the device to push (or stop pushing) state changes for a pin.
    ///
    /// Fails with `InvalidMode` unless the pin is currently in an input mode:
    /// only input pins may contribute to a port's monitored bitmask. Analog
    /// input pins toggle per analog index, unconditionally. Digital input
    /// pins update the port's monitored bitmask; the wire message goes out
    /// only when the port aggregate flips.
    pub fn set_report(&self, pos: usize, on: bool) -> Result<()> {
        let pin = self.shared.pins.get(pos)?.clone();
        let mode = pin.mode();
        if !mode.is_input() {
            return Err(Error::InvalidMode { pin: pos, mode });
        }
        self.report_pin(&pin, on)
    }

    fn report_pin(&self, pin: &Pin, on: bool) -> Result<()> {
        if pin.mode() == PinMode::AnalogIn {
            let idx = pin.analog().ok_or_else(|| {
                Error::OutOfRange(format!("pin {} has no analog index", pin.digital()))
            })?;
            self.link.send(message::report_analog(idx), &[on as u8])?;
        } else {
            let (port, bit) = port_of(pin.digital());
            let mut ports = self.ports.lock();
            let mask = ports.entry(port).or_default();
            let before = *mask != 0;
            if on {
                *mask |= 1 << bit;
            } else {
                *mask &= !(1 << bit);
            }
            let after = *mask != 0;
            if before != after {
                self.link.send(message::report_port(port), &[after as u8])?;
            }
        }
        pin.record_reporting(on);
        Ok(())
    }

    /// Inputs report, outputs do not.
    fn apply_report_policy(&self) -> Result<()> {
        for pin in &self.shared.pins {
            let mode = pin.mode();
            if mode.is_input() {
                self.report_pin(pin, true)?;
            } else if mode.is_output() {
                self.report_pin(pin, false)?;
            }
        }
        Ok(())
    }

    /// Set the device's sampling interval, clamped to the wire maximum.
    pub fn set_sample_rate(&self, interval: Duration) -> Result<()> {
        let ms = interval.as_millis().min(16383) as i32;
        self.link.send(message::SAMPLE_RATE, &message::to_data(ms))
    }

    /// Reset the device, re-query pin states and reapply the report policy.
    /// Capabilities and analog mapping are fixed for the device's lifetime
    /// and are not re-queried.
    pub async fn reset(&self) -> Result<()> {
        self.link.send(message::RESET, &[])?;

        for pin in &self.shared.pins {
            query_state(&self.link, pin).await?;
        }

        // the device forgot its reporting config; start over from a clean
        // baseline so the enables actually go out again
        self.ports.lock().clear();
        for pin in &self.shared.pins {
            pin.record_reporting(false);
        }
        self.apply_report_policy()
    }

    #[cfg(test)]
    pub(crate) async fn wait_with(&self, reply: MsgId, timeout: Duration) -> Result<Payload> {
        self.link.wait_with(reply, timeout).await
    }

    #[cfg(test)]
    pub(crate) fn router_len(&self) -> usize {
        self.link.router.len()
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.link.router.unsubscribe(self.sub);
        self.pump.abort();
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("protocol", &self.protocol)
            .field("firmware", &self.firmware)
            .field("pins", &self.shared.pins.count())
            .finish()
    }
}

/// Owns the transport: forwards outbound frames and decodes inbound chunks
/// into the message chain.
async fn pump<T: Transport>(
    mut transport: T,
    mut out: mpsc::UnboundedReceiver<Vec<u8>>,
    router: Arc<CallChain<(MsgId, Payload)>>,
) {
    let mut decoder = Decoder::new();
    loop {
        tokio::select! {
            frame = out.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = transport.send(&bytes).await {
                        warn!("transport write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            chunk = transport.recv() => match chunk {
                Ok(bytes) => {
                    decoder.feed(&bytes);
                    while let Some((id, data)) = decoder.next() {
                        trace!(?id, len = data.len(), "recv");
                        router.emit(&(id, data));
                    }
                }
                Err(e) => {
                    warn!("transport closed: {e}");
                    break;
                }
            },
        }
    }
}

/// Handle one unsolicited message. Messages referencing unknown pins or
/// indices are ignored; the device may be ahead of our local picture.
fn on_read(shared: &SessionShared, id: MsgId, data: &[u8]) {
    if let Some(port) = id.as_port_value() {
        if data.len() < 2 {
            return;
        }
        let mask = message::to_value(data);
        for bit in 0..8 {
            let pos = port * 8 + bit;
            let Ok(pin) = shared.pins.get(pos) else {
                continue;
            };
            // a pin reconfigured to output since the message was in flight
            // keeps its value; last writer wins
            if pin.mode().is_digital_input() {
                pin.change_state((mask >> bit) & 1);
            }
        }
    } else if let Some(idx) = id.as_analog_value() {
        if let Ok(pin) = shared.pins.get_analog(idx) {
            if pin.mode() == PinMode::AnalogIn {
                pin.change_state(message::to_value(data));
            }
        }
    } else if id == message::STRING_DATA {
        let text = message::to_string(data);
        let changed = {
            let mut current = shared.text.lock();
            if *current == text {
                false
            } else {
                *current = text.clone();
                true
            }
        };
        if changed {
            shared.text_changed.emit(&text);
        }
    }
}

async fn query_protocol(link: &Link) -> Result<Protocol> {
    let data = link.query(message::VERSION, &[], message::VERSION).await?;
    if data.len() < 2 {
        return Err(Error::MalformedMessage("short version response".to_string()));
    }
    Ok(Protocol {
        major: data[0],
        minor: data[1],
    })
}

async fn query_firmware(link: &Link) -> Result<Firmware> {
    let data = link
        .query(message::FIRMWARE_QUERY, &[], message::FIRMWARE_RESPONSE)
        .await?;
    if data.len() < 2 {
        return Err(Error::MalformedMessage("short firmware response".to_string()));
    }
    Ok(Firmware {
        major: data[0],
        minor: data[1],
        name: message::to_string(&data[2..]),
    })
}

type Capability = (BTreeSet<PinMode>, BTreeMap<PinMode, u8>);

/// Parse the capability response: runs of (mode, resolution) pairs per pin,
/// pins separated by the delimiter byte.
async fn query_capabilities(link: &Link) -> Result<Vec<Capability>> {
    let data = link
        .query(message::CAPABILITY_QUERY, &[], message::CAPABILITY_RESPONSE)
        .await?;

    let mut caps = Vec::new();
    let mut modes = BTreeSet::new();
    let mut resolutions = BTreeMap::new();

    let mut i = 0;
    while i < data.len() {
        if data[i] == message::CAPABILITY_DELIMITER {
            caps.push((std::mem::take(&mut modes), std::mem::take(&mut resolutions)));
            i += 1;
        } else {
            if i + 1 >= data.len() {
                return Err(Error::MalformedMessage(
                    "dangling mode byte in capability response".to_string(),
                ));
            }
            match PinMode::from_byte(data[i]) {
                Some(mode) => {
                    modes.insert(mode);
                    resolutions.insert(mode, data[i + 1]);
                }
                None => debug!(mode = data[i], "ignoring unknown capability mode"),
            }
            i += 2;
        }
    }

    if !modes.is_empty() {
        return Err(Error::MalformedMessage(
            "unterminated pin in capability response".to_string(),
        ));
    }
    Ok(caps)
}

/// Parse the analog mapping response: one byte per digital position, either
/// the delimiter ("no analog index") or the pin's analog index.
async fn query_analog_mapping(link: &Link, pin_count: usize) -> Result<Vec<Option<usize>>> {
    let data = link
        .query(
            message::ANALOG_MAPPING_QUERY,
            &[],
            message::ANALOG_MAPPING_RESPONSE,
        )
        .await?;

    let mut analogs = vec![None; pin_count];
    for (pos, &byte) in data.iter().enumerate() {
        if byte != message::CAPABILITY_DELIMITER {
            match analogs.get_mut(pos) {
                Some(slot) => *slot = Some(byte as usize),
                None => debug!(pos, "analog mapping entry beyond capability table"),
            }
        }
    }
    Ok(analogs)
}

/// Query one pin's mode and legacy value, applying both to the pin.
async fn query_state(link: &Link, pin: &Pin) -> Result<()> {
    let pos = pin.digital();
    let data = link
        .query(
            message::PIN_STATE_QUERY,
            &[pos as u8],
            message::PIN_STATE_RESPONSE,
        )
        .await?;
    if data.len() < 3 || data[0] as usize != pos {
        return Err(Error::MalformedMessage(format!(
            "bad state response for pin {pos}"
        )));
    }
    if let Some(mode) = PinMode::from_byte(data[1]) {
        pin.record_mode(mode);
    }
    pin.change_state(message::to_value(&data[2..]));
    Ok(())
}
