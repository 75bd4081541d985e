//! Transport-neutral packet model
//!
//! A [`Packet`] is what both wire codecs decode into and encode from. It is
//! immutable once built; the payload is a shared [`Bytes`] buffer so typed
//! views can borrow from it without copying.

use std::fmt;

use bitfield::bitfield;
use bytes::Bytes;

use crate::error::{DccError, Result};
use crate::hex;
use crate::limits::{
    MX1_MAX_PAYLOAD, MX1_SHORT_FRAME_MAX_PAYLOAD, ZCAN_MAX_COMMAND, ZCAN_MAX_PAYLOAD,
};
use crate::selector::Selector;
use crate::view::PacketView;

/// Wire transport a packet travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Transport {
    /// Serial point-to-point link with SOH/EOT framing
    Mx1,
    /// CAN-derived packets carried in UDP datagrams
    Zcan,
}

impl Transport {
    /// Largest payload the transport carries
    pub fn max_payload(&self) -> usize {
        match self {
            Transport::Mx1 => MX1_MAX_PAYLOAD,
            Transport::Zcan => ZCAN_MAX_PAYLOAD,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Mx1 => write!(f, "MX1"),
            Transport::Zcan => write!(f, "ZCAN"),
        }
    }
}

/// Role of a packet in an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandMode {
    /// Query, expects an ACK carrying data
    Request = 0,
    /// Instruction to change state
    Command = 1,
    /// Unsolicited state report
    Event = 2,
    /// Answer to a request or command
    Ack = 3,
}

impl CommandMode {
    /// Decode the two mode bits; every value maps to a mode
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => CommandMode::Request,
            1 => CommandMode::Command,
            2 => CommandMode::Event,
            _ => CommandMode::Ack,
        }
    }

    /// Two-bit wire value
    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for CommandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandMode::Request => write!(f, "REQUEST"),
            CommandMode::Command => write!(f, "COMMAND"),
            CommandMode::Event => write!(f, "EVENT"),
            CommandMode::Ack => write!(f, "ACK"),
        }
    }
}

bitfield! {
    /// Envelope flags carried by MX1 frames
    ///
    /// Bits 1..0 of the MX1 flag byte hold the [`CommandMode`] and are kept
    /// out of this set; [`PacketFlags::MODE_MASK`] clears them.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags(u8);
    impl Debug;
    /// Frame carries a 16-bit CRC trailer
    pub long_frame, set_long_frame: 7;
    /// Frame was sent by the command station
    pub from_station, set_from_station: 6;
    /// Sender wants an explicit acknowledgement
    pub ack_required, set_ack_required: 5;
}

impl PacketFlags {
    /// Bits of the MX1 flag byte owned by the command mode
    pub const MODE_MASK: u8 = 0x03;

    /// Flags from a raw MX1 flag byte, dropping the mode bits
    pub fn from_wire(byte: u8) -> Self {
        PacketFlags(byte & !Self::MODE_MASK)
    }

    /// Raw flag bits
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// One decoded protocol message
///
/// Packets are compared by identity: share them as `Arc<Packet>` and use
/// [`std::sync::Arc::ptr_eq`]. [`Packet::content_eq`] compares field by
/// field.
#[derive(Debug, Clone)]
pub struct Packet {
    transport: Transport,
    sender: u16,
    group: u8,
    mode: CommandMode,
    command: u8,
    flags: PacketFlags,
    payload: Bytes,
}

impl Packet {
    /// Start building a packet for `transport`
    pub fn builder(transport: Transport) -> PacketBuilder {
        PacketBuilder::new(transport)
    }

    /// Assemble a packet decoded off the wire, keeping the flags as sent
    pub(crate) fn from_wire(
        transport: Transport,
        sender: u16,
        group: u8,
        mode: CommandMode,
        command: u8,
        flags: PacketFlags,
        payload: Bytes,
    ) -> Result<Packet> {
        let max = transport.max_payload();
        if payload.len() > max {
            return Err(DccError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(Packet {
            transport,
            sender,
            group,
            mode,
            command,
            flags,
            payload,
        })
    }

    /// Transport the packet belongs to
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Sender network id (ZCAN) or frame sequence number (MX1)
    pub fn sender(&self) -> u16 {
        self.sender
    }

    /// Command group; always 0 on MX1
    pub fn group(&self) -> u8 {
        self.group
    }

    /// Command mode
    pub fn mode(&self) -> CommandMode {
        self.mode
    }

    /// Command code (6 bit on ZCAN, 8 bit on MX1)
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Envelope flags
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Shared read-only payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Typed view of this packet, if `V` can interpret it
    ///
    /// Returns `None` when the packet does not match the view's selector or
    /// its payload is too short for the view's layout.
    pub fn adapter<V: PacketView>(&self) -> Option<V> {
        match self.try_adapter::<V>()? {
            Ok(view) => Some(view),
            Err(e) => {
                log::debug!("{} does not decode as {}: {}", self, V::KIND, e);
                None
            }
        }
    }

    /// Like [`Packet::adapter`], keeping the decode failure
    pub fn try_adapter<V: PacketView>(&self) -> Option<Result<V>> {
        if !V::selector().matches(self) {
            return None;
        }
        Some(V::from_packet(self))
    }

    /// Field-by-field comparison
    pub fn content_eq(&self, other: &Packet) -> bool {
        self.transport == other.transport
            && self.sender == other.sender
            && self.group == other.group
            && self.mode == other.mode
            && self.command == other.command
            && self.flags == other.flags
            && self.payload == other.payload
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02X}.{:02X} {} from {:04X} [{}]",
            self.transport,
            self.group,
            self.command,
            self.mode,
            self.sender,
            hex::format(&self.payload)
        )
    }
}

/// Builder for [`Packet`]
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    transport: Transport,
    sender: u16,
    group: u8,
    mode: CommandMode,
    command: u8,
    flags: PacketFlags,
    payload: Bytes,
}

impl PacketBuilder {
    /// Create a new packet builder
    pub fn new(transport: Transport) -> Self {
        PacketBuilder {
            transport,
            sender: 0,
            group: 0,
            mode: CommandMode::Request,
            command: 0,
            flags: PacketFlags::default(),
            payload: Bytes::new(),
        }
    }

    /// Set the sender id (ZCAN) or sequence number (MX1)
    pub fn with_sender(mut self, sender: u16) -> Self {
        self.sender = sender;
        self
    }

    /// Set the command group
    pub fn with_group(mut self, group: u8) -> Self {
        self.group = group;
        self
    }

    /// Set the command mode
    pub fn with_mode(mut self, mode: CommandMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the command code
    pub fn with_command(mut self, command: u8) -> Self {
        self.command = command;
        self
    }

    /// Set the envelope flags
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Build the packet
    ///
    /// MX1 packets whose payload does not fit a short frame are switched to
    /// long frames automatically.
    pub fn build(mut self) -> Result<Packet> {
        let max = self.transport.max_payload();
        if self.payload.len() > max {
            return Err(DccError::PayloadTooLarge {
                len: self.payload.len(),
                max,
            });
        }

        match self.transport {
            Transport::Zcan => {
                if self.command > ZCAN_MAX_COMMAND {
                    return Err(DccError::malformed(format!(
                        "ZCAN command 0x{:02X} exceeds 6 bits",
                        self.command
                    )));
                }
                self.flags = PacketFlags::default();
            }
            Transport::Mx1 => {
                if self.sender > 0xFF {
                    return Err(DccError::malformed(format!(
                        "MX1 sequence {} exceeds 8 bits",
                        self.sender
                    )));
                }
                if self.group != 0 {
                    return Err(DccError::malformed("MX1 packets carry no group"));
                }
                if self.payload.len() > MX1_SHORT_FRAME_MAX_PAYLOAD {
                    self.flags.set_long_frame(true);
                }
            }
        }

        Ok(Packet {
            transport: self.transport,
            sender: self.sender,
            group: self.group,
            mode: self.mode,
            command: self.command,
            flags: self.flags,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_mode_bits() {
        for mode in [
            CommandMode::Request,
            CommandMode::Command,
            CommandMode::Event,
            CommandMode::Ack,
        ] {
            assert_eq!(CommandMode::from_bits(mode.bits()), mode);
        }
        assert_eq!(CommandMode::from_bits(0xFD), CommandMode::Command);
    }

    #[test]
    fn test_packet_flags() {
        let flags = PacketFlags::from_wire(0xC3);
        assert!(flags.long_frame());
        assert!(flags.from_station());
        assert!(!flags.ack_required());
        assert_eq!(flags.bits(), 0xC0);
    }

    #[test]
    fn test_build_zcan_packet() -> Result<()> {
        let packet = Packet::builder(Transport::Zcan)
            .with_group(0x00)
            .with_command(0x3F)
            .with_mode(CommandMode::Command)
            .with_sender(0xC2FF)
            .with_payload(vec![0x01, 0x02])
            .build()?;

        assert_eq!(packet.transport(), Transport::Zcan);
        assert_eq!(packet.command(), 0x3F);
        assert_eq!(packet.mode(), CommandMode::Command);
        assert_eq!(packet.sender(), 0xC2FF);
        assert_eq!(packet.payload().as_ref(), &[0x01, 0x02]);
        assert_eq!(packet.to_string(), "ZCAN 00.3F COMMAND from C2FF [01 02]");
        Ok(())
    }

    #[test]
    fn test_build_rejects_out_of_range() {
        let too_long = Packet::builder(Transport::Zcan)
            .with_payload(vec![0u8; ZCAN_MAX_PAYLOAD + 1])
            .build();
        assert!(matches!(too_long, Err(DccError::PayloadTooLarge { .. })));

        let wide_command = Packet::builder(Transport::Zcan).with_command(0x40).build();
        assert!(wide_command.is_err());

        let wide_sequence = Packet::builder(Transport::Mx1).with_sender(0x100).build();
        assert!(wide_sequence.is_err());

        let grouped = Packet::builder(Transport::Mx1).with_group(2).build();
        assert!(grouped.is_err());
    }

    #[test]
    fn test_mx1_long_frame_selection() -> Result<()> {
        let short = Packet::builder(Transport::Mx1)
            .with_payload(vec![0u8; MX1_SHORT_FRAME_MAX_PAYLOAD])
            .build()?;
        assert!(!short.flags().long_frame());

        let long = Packet::builder(Transport::Mx1)
            .with_payload(vec![0u8; MX1_SHORT_FRAME_MAX_PAYLOAD + 1])
            .build()?;
        assert!(long.flags().long_frame());
        Ok(())
    }

    #[test]
    fn test_content_eq_vs_identity() -> Result<()> {
        let a = std::sync::Arc::new(
            Packet::builder(Transport::Mx1)
                .with_command(0x13)
                .with_payload(vec![0, 3, 0, 29])
                .build()?,
        );
        let b = std::sync::Arc::new((*a).clone());

        assert!(a.content_eq(&b));
        assert!(!std::sync::Arc::ptr_eq(&a, &b));
        Ok(())
    }
}
