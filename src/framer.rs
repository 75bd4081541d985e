//! MX1 byte-stream framing
//!
//! On the wire a frame is `SOH SOH <escaped body> EOT`. Inside the body any
//! raw `SOH`, `DLE` or `EOT` is sent as `DLE, byte ^ 0x20`.
//!
//! [`Framer`] consumes bytes one at a time and yields [`FramerEvent`]s:
//!
//! ```text
//! Init --SOH--> Soh --SOH--> Data --DLE--> EscapeStart --x^0x20--> EscapedData --> Data
//!                             |                 |
//!                             +--EOT--> frame   +--other--> Error --> Init
//! ```

use bytes::{Bytes, BytesMut};
use log::{trace, warn};

use crate::error::{DccError, Result};
use crate::hex;

/// Start-of-header marker
pub const SOH: u8 = 0x01;
/// Escape marker
pub const DLE: u8 = 0x10;
/// End-of-transmission marker
pub const EOT: u8 = 0x17;
/// Value XOR-ed into escaped bytes
pub const ESCAPE_XOR: u8 = 0x20;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, SOH | DLE | EOT)
}

/// Escape a frame body without adding markers
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 8);
    for &b in body {
        if needs_escape(b) {
            out.push(DLE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

/// Undo [`escape`]
///
/// Fails on a trailing `DLE` or a `DLE` followed by anything other than an
/// escaped marker.
pub fn unescape(escaped: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut iter = escaped.iter();

    while let Some(&b) = iter.next() {
        if b != DLE {
            out.push(b);
            continue;
        }
        let next = *iter
            .next()
            .ok_or_else(|| DccError::framing("escape at end of buffer"))?;
        let literal = next ^ ESCAPE_XOR;
        if !needs_escape(literal) {
            return Err(DccError::framing(format!(
                "illegal escape sequence 10 {:02X}",
                next
            )));
        }
        out.push(literal);
    }

    Ok(out)
}

/// Escape a frame body and surround it with `SOH SOH` ... `EOT`
pub fn wrap(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 8 + 3);
    out.push(SOH);
    out.push(SOH);
    out.extend(escape(body));
    out.push(EOT);
    out
}

/// Framer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Waiting for the first `SOH`
    Init,
    /// One `SOH` seen, waiting for the confirming second one
    Soh,
    /// Collecting body bytes
    Data,
    /// `DLE` seen, next byte is escaped
    EscapeStart,
    /// Handling a de-escaped byte; an `EOT` here is data
    EscapedData,
    /// Framing violation; buffer is discarded and the framer re-arms
    Error,
}

/// Output of the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    /// A complete, de-escaped frame including its CRC trailer
    Frame(Bytes),
    /// The stream lost synchronisation; any partial frame was dropped
    LinkError,
}

/// Incremental MX1 frame recogniser
#[derive(Debug)]
pub struct Framer {
    state: FrameState,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Framer {
    /// Create a framer that rejects frames longer than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Framer {
            state: FrameState::Init,
            buffer: BytesMut::with_capacity(max_frame_size.min(256)),
            max_frame_size,
        }
    }

    /// Current state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of body bytes collected so far
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame and wait for a new start marker
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = FrameState::Init;
    }

    /// Feed a chunk of bytes, returning every event it completes
    pub fn push(&mut self, data: &[u8]) -> Vec<FramerEvent> {
        data.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Feed one byte
    pub fn push_byte(&mut self, byte: u8) -> Option<FramerEvent> {
        trace!("mx1 framer {:?} <- {:02X}", self.state, byte);

        match self.state {
            FrameState::Init => {
                if byte == SOH {
                    self.state = FrameState::Soh;
                }
                None
            }
            FrameState::Soh => {
                if byte == SOH {
                    self.state = FrameState::Data;
                }
                None
            }
            FrameState::Data | FrameState::EscapedData => self.handle_data(byte),
            FrameState::EscapeStart => {
                let literal = byte ^ ESCAPE_XOR;
                if !needs_escape(literal) {
                    warn!("mx1 framer: illegal escape 10 {:02X}", byte);
                    return self.fail();
                }
                self.state = FrameState::EscapedData;
                self.handle_data(literal)
            }
            // never left standing; `fail` re-arms immediately
            FrameState::Error => {
                self.reset();
                self.push_byte(byte)
            }
        }
    }

    fn handle_data(&mut self, byte: u8) -> Option<FramerEvent> {
        let escaped = self.state == FrameState::EscapedData;
        self.state = FrameState::Data;

        if !escaped {
            match byte {
                DLE => {
                    self.state = FrameState::EscapeStart;
                    return None;
                }
                EOT => return Some(self.complete()),
                // repeated start markers before the body are a resync idiom
                SOH if self.buffer.is_empty() => return None,
                _ => {}
            }
        }

        if self.buffer.len() >= self.max_frame_size {
            warn!(
                "mx1 framer: frame exceeds {} bytes, discarding",
                self.max_frame_size
            );
            return self.fail();
        }
        self.buffer.extend_from_slice(&[byte]);
        None
    }

    fn complete(&mut self) -> FramerEvent {
        let frame = self.buffer.split().freeze();
        self.state = FrameState::Init;
        trace!("mx1 framer: frame [{}]", hex::format(&frame));
        FramerEvent::Frame(frame)
    }

    fn fail(&mut self) -> Option<FramerEvent> {
        self.state = FrameState::Error;
        self.reset();
        Some(FramerEvent::LinkError)
    }
}
