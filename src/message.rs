//! Wire-level message codec for the Firmata protocol.
//!
//! Provides message identifiers, framing/parsing against a raw byte stream,
//! and the 7-bit group encodings used for values and strings.

use bytes::{Buf, BytesMut};
use std::fmt;
use tracing::trace;

/// Sysex start marker.
pub const START_SYSEX: u8 = 0xF0;

/// Sysex end marker.
pub const END_SYSEX: u8 = 0xF7;

/// Separates per-pin runs in a capability response; also marks "no analog
/// index" in an analog mapping response.
pub const CAPABILITY_DELIMITER: u8 = 0x7F;

/// Sysex type byte reserved for extended (2-byte) message ids.
pub const EXTEND_SYSEX: u8 = 0x00;

/// Message payload: a sequence of 7-bit data bytes.
pub type Payload = Vec<u8>;

/// 32-bit tagged message identifier.
///
/// Three shapes, derivable purely from the numeric encoding:
/// - standard: the id is a single byte in the low 8 bits
/// - sysex: low byte is `0xF0`, the sysex type byte sits in bits 8..16
/// - extended sysex: sysex with a zero type byte and a 14-bit extended id
///   in bits 16..32
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(pub u32);

impl MsgId {
    /// Standard single-byte message id.
    pub const fn standard(id: u8) -> Self {
        MsgId(id as u32)
    }

    /// Sysex message id from a sysex type byte.
    pub const fn sysex(id: u8) -> Self {
        MsgId(START_SYSEX as u32 | ((id as u32) << 8))
    }

    /// Extended sysex message id from a 14-bit extended id.
    pub const fn ext_sysex(id: u16) -> Self {
        MsgId(START_SYSEX as u32 | ((id as u32) << 16))
    }

    pub const fn is_sysex(self) -> bool {
        self.0 & 0xFF == START_SYSEX as u32
    }

    pub const fn is_ext_sysex(self) -> bool {
        self.is_sysex() && (self.0 >> 8) & 0xFF == 0
    }

    /// Port index if this is a digital port-value message.
    pub fn as_port_value(self) -> Option<usize> {
        match self.0 {
            0x90..=0x9F => Some((self.0 - 0x90) as usize),
            _ => None,
        }
    }

    /// Analog index if this is an inline analog-value message.
    pub fn as_analog_value(self) -> Option<usize> {
        match self.0 {
            0xE0..=0xEF => Some((self.0 - 0xE0) as usize),
            _ => None,
        }
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ext_sysex() {
            write!(f, "ext_sysex({:#06x})", self.0 >> 16)
        } else if self.is_sysex() {
            write!(f, "sysex({:#04x})", (self.0 >> 8) & 0xFF)
        } else {
            write!(f, "msg({:#04x})", self.0)
        }
    }
}

// Standard message ids.
pub const VERSION: MsgId = MsgId::standard(0xF9);
pub const RESET: MsgId = MsgId::standard(0xFF);
pub const PIN_MODE: MsgId = MsgId::standard(0xF4);
pub const DIGITAL_VALUE: MsgId = MsgId::standard(0xF5);

// Sysex message ids.
pub const ANALOG_MAPPING_QUERY: MsgId = MsgId::sysex(0x69);
pub const ANALOG_MAPPING_RESPONSE: MsgId = MsgId::sysex(0x6A);
pub const CAPABILITY_QUERY: MsgId = MsgId::sysex(0x6B);
pub const CAPABILITY_RESPONSE: MsgId = MsgId::sysex(0x6C);
pub const PIN_STATE_QUERY: MsgId = MsgId::sysex(0x6D);
pub const PIN_STATE_RESPONSE: MsgId = MsgId::sysex(0x6E);
pub const EXTENDED_ANALOG: MsgId = MsgId::sysex(0x6F);
pub const STRING_DATA: MsgId = MsgId::sysex(0x71);
pub const FIRMWARE_QUERY: MsgId = MsgId::sysex(0x79);
pub const FIRMWARE_RESPONSE: MsgId = MsgId::sysex(0x79);
pub const SAMPLE_RATE: MsgId = MsgId::sysex(0x7A);

/// Inline analog-value message for analog index 0..=15.
pub fn analog_value(index: usize) -> MsgId {
    MsgId::standard(0xE0 + (index as u8 & 0x0F))
}

/// Digital port-value message for port 0..=15.
pub fn port_value(port: usize) -> MsgId {
    MsgId::standard(0x90 + (port as u8 & 0x0F))
}

/// Report enable/disable for analog index 0..=15.
pub fn report_analog(index: usize) -> MsgId {
    MsgId::standard(0xC0 + (index as u8 & 0x0F))
}

/// Report enable/disable for digital port 0..=15.
pub fn report_port(port: usize) -> MsgId {
    MsgId::standard(0xD0 + (port as u8 & 0x0F))
}

/// Frame a message for the wire.
///
/// Standard ids emit the id byte followed by the payload verbatim; sysex ids
/// are bracketed by the start/end markers, with the extended id encoded as two
/// 7-bit bytes, least significant first.
pub fn frame(id: MsgId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    if id.is_ext_sysex() {
        let ext = (id.0 >> 16) as u16;
        out.push(START_SYSEX);
        out.push(EXTEND_SYSEX);
        out.push((ext & 0x7F) as u8);
        out.push(((ext >> 7) & 0x7F) as u8);
    } else if id.is_sysex() {
        out.push(START_SYSEX);
        out.push((id.0 >> 8) as u8);
    } else {
        out.push(id.0 as u8);
    }
    out.extend_from_slice(data);
    if id.is_sysex() {
        out.push(END_SYSEX);
    }
    out
}

/// Outcome of scanning the front of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// The buffer does not hold a complete message yet.
    NeedMore,
    /// `len` leading bytes cannot begin a message and should be dropped.
    Noise { len: usize },
    /// A complete message occupying the first `len` bytes of the buffer.
    Message { id: MsgId, data: Payload, len: usize },
}

/// True for bytes that may begin a device-to-host message. Host-to-device ids
/// (report toggles, pin-mode and value writes, reset) are treated as noise so
/// echoed or looped-back host traffic is not consumed as a message.
fn leads_message(byte: u8) -> bool {
    matches!(byte, START_SYSEX | 0x90..=0x9F | 0xE0..=0xEF | 0xF9)
}

/// Try to parse one message from the front of `buf`.
///
/// Tolerates a partial buffer: `NeedMore` is distinct from malformed input.
/// Leading high bytes that cannot begin a message are reported as `Noise`
/// before any minimum-length check; a stray end marker with no open frame is
/// noise as well.
pub fn parse(buf: &[u8]) -> Parsed {
    let noise = buf
        .iter()
        .take_while(|&&b| b >= 0x80 && b != END_SYSEX && !leads_message(b))
        .count();
    if noise > 0 {
        return Parsed::Noise { len: noise };
    }
    match buf.first() {
        None => return Parsed::NeedMore,
        Some(&END_SYSEX) => return Parsed::Noise { len: 1 },
        Some(_) => {}
    }

    // minimum complete message is 3 bytes: id + two data bytes, or an
    // empty sysex frame
    if buf.len() < 3 {
        return Parsed::NeedMore;
    }

    if buf[0] == START_SYSEX {
        let (id, header) = if buf[1] == EXTEND_SYSEX {
            if buf.len() < 4 {
                return Parsed::NeedMore;
            }
            let ext = (buf[2] as u16 & 0x7F) | ((buf[3] as u16 & 0x7F) << 7);
            (MsgId::ext_sysex(ext), 4)
        } else {
            (MsgId::sysex(buf[1]), 2)
        };
        match buf[header..].iter().position(|&b| b == END_SYSEX) {
            Some(end) => Parsed::Message {
                id,
                data: buf[header..header + end].to_vec(),
                len: header + end + 1,
            },
            None => Parsed::NeedMore,
        }
    } else {
        Parsed::Message {
            id: MsgId::standard(buf[0]),
            data: buf[1..3].to_vec(),
            len: 3,
        }
    }
}

/// Incremental decoder over a raw byte stream.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, discarding any interleaved noise.
    pub fn next(&mut self) -> Option<(MsgId, Payload)> {
        loop {
            match parse(&self.buf) {
                Parsed::NeedMore => return None,
                Parsed::Noise { len } => {
                    trace!(len, "skipping protocol noise");
                    self.buf.advance(len);
                }
                Parsed::Message { id, data, len } => {
                    self.buf.advance(len);
                    return Some((id, data));
                }
            }
        }
    }
}

/// Decode a 7-bit group encoded integer, least significant group first.
pub fn to_value(data: &[u8]) -> i32 {
    let mut value: i64 = 0;
    for (i, &byte) in data.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as i64) << (7 * i);
    }
    value.min(i32::MAX as i64) as i32
}

/// Encode a non-negative integer into 7-bit groups, least significant first.
/// Always emits at least one byte.
pub fn to_data(value: i32) -> Payload {
    let mut v = value.max(0) as u32;
    let mut data = Payload::new();
    loop {
        data.push((v & 0x7F) as u8);
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    data
}

/// Decode 7-bit packed text: bytes are paired `(low7, high7)` into one 8-bit
/// character each; a trailing unpaired byte is dropped.
pub fn to_string(data: &[u8]) -> String {
    data.chunks_exact(2)
        .map(|pair| ((pair[0] as u16 | ((pair[1] as u16) << 7)) as u8) as char)
        .collect()
}
