//! ZCAN packet codec
//!
//! Implements the 8-byte header carried in every UDP datagram:
//! ```text
//! ┌────────────┬──────────┬───────┬────────────────┬───────────┐
//! │ Length     │ Reserved │ Group │ Command | Mode │ Sender    │
//! │ u16 LE     │ u16 (0)  │ u8    │ u8 (cmd<<2|m)  │ u16 LE    │
//! └────────────┴──────────┴───────┴────────────────┴───────────┘
//! ```
//!
//! followed by `Length` payload bytes. A datagram may carry several packets
//! back to back.

use bitfield::bitfield;
use bytes::Bytes;
use log::{debug, warn};

use crate::address::{CvAddress, DecoderAddress};
use crate::error::{DccError, Result};
use crate::limits::{FUNCTION_COUNT, ZCAN_MAX_PAYLOAD};
use crate::packet::{CommandMode, Packet, PacketFlags, Transport};
use crate::view::{CvReadState, PowerState};

/// Header size in bytes (fixed, exactly 8)
pub const HEADER_LEN: usize = 8;

/// Decoder field value addressing the programming track
pub const SERVICE_TRACK: u16 = 0;

/// Command groups
pub mod group {
    /// Track power and station control
    pub const SYSTEM: u8 = 0x00;
    /// Accessory decoders
    pub const ACCESSORY: u8 = 0x01;
    /// Locomotives
    pub const VEHICLE: u8 = 0x02;
    /// RailCom feedback
    pub const RAILCOM: u8 = 0x07;
    /// Station configuration
    pub const CONFIG: u8 = 0x08;
    /// Decoder programming (CV access)
    pub const PROGRAMMING: u8 = 0x16;
}

/// Command codes (6 bit, unique within their group)
pub mod cmd {
    /// SYSTEM: track output state
    pub const POWER: u8 = 0x00;
    /// VEHICLE: speed and direction
    pub const SPEED: u8 = 0x02;
    /// VEHICLE: function state
    pub const FUNCTION: u8 = 0x04;
    /// PROGRAMMING: read one CV
    pub const CV_READ: u8 = 0x08;
    /// PROGRAMMING: write one CV
    pub const CV_WRITE: u8 = 0x09;
}

/// Bits of the 16-bit speed word
pub mod speed {
    /// Speed value bits
    pub const SPEED_MASK: u16 = 0x03FF;
    /// Direction of travel is forward
    pub const FORWARD: u16 = 0x0400;
    /// Emergency stop requested or active
    pub const EMERGENCY_STOP: u16 = 0x0800;
}

bitfield! {
    /// The combined command/mode byte of the header
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CommandByte(u8);
    impl Debug;
    /// 6-bit command code
    pub u8, command, set_command: 7, 2;
    /// 2-bit command mode
    pub u8, mode_bits, set_mode_bits: 1, 0;
}

impl CommandByte {
    /// Pack a command and mode
    pub fn new(command: u8, mode: CommandMode) -> Self {
        let mut byte = CommandByte(0);
        byte.set_command(command);
        byte.set_mode_bits(mode.bits());
        byte
    }

    /// Decoded mode
    pub fn mode(&self) -> CommandMode {
        CommandMode::from_bits(self.mode_bits())
    }

    /// Raw byte
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Decoded header from wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes
    pub payload_len: u16,
    /// Reserved, sent as 0
    pub reserved: u16,
    /// Command group
    pub group: u8,
    /// Command and mode
    pub command: CommandByte,
    /// Sender network id
    pub sender: u16,
}

impl Header {
    /// Encode header to bytes (little-endian)
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        buf[4] = self.group;
        buf[5] = self.command.bits();
        buf[6..8].copy_from_slice(&self.sender.to_le_bytes());
        buf
    }

    /// Decode header from bytes (little-endian)
    ///
    /// Returns an error if the buffer is shorter than `HEADER_LEN`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DccError::malformed(format!(
                "ZCAN header needs {} bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        }
        Ok(Header {
            payload_len: u16::from_le_bytes([buf[0], buf[1]]),
            reserved: u16::from_le_bytes([buf[2], buf[3]]),
            group: buf[4],
            command: CommandByte(buf[5]),
            sender: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// Append the wire form of `packet` to `out`
pub fn encode_into(packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
    if packet.transport() != Transport::Zcan {
        return Err(DccError::malformed(format!(
            "cannot send {} packet over ZCAN",
            packet.transport()
        )));
    }
    let payload_len = u16::try_from(packet.len()).map_err(|_| DccError::PayloadTooLarge {
        len: packet.len(),
        max: ZCAN_MAX_PAYLOAD,
    })?;

    let header = Header {
        payload_len,
        reserved: 0,
        group: packet.group(),
        command: CommandByte::new(packet.command(), packet.mode()),
        sender: packet.sender(),
    };
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(packet.payload());
    Ok(())
}

/// Wire form of `packet`
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + packet.len());
    encode_into(packet, &mut out)?;
    Ok(out)
}

/// Decode the packet at the start of `buf`, returning it and the number of
/// bytes it occupied
pub fn decode_prefix(buf: &Bytes) -> Result<(Packet, usize)> {
    let header = Header::decode(buf)?;
    let payload_len = usize::from(header.payload_len);
    let total = HEADER_LEN + payload_len;

    if buf.len() < total {
        return Err(DccError::malformed(format!(
            "ZCAN payload length {} but only {} bytes follow the header",
            payload_len,
            buf.len() - HEADER_LEN
        )));
    }
    if header.reserved != 0 {
        debug!("zcan: reserved header field is 0x{:04X}", header.reserved);
    }

    let packet = Packet::from_wire(
        Transport::Zcan,
        header.sender,
        header.group,
        header.command.mode(),
        header.command.command(),
        PacketFlags::default(),
        buf.slice(HEADER_LEN..total),
    )?;
    Ok((packet, total))
}

/// Decode the first packet in `buf`; trailing bytes are ignored
pub fn decode(buf: &Bytes) -> Result<Packet> {
    decode_prefix(buf).map(|(packet, _)| packet)
}

/// Decode every packet of a datagram
///
/// A malformed tail after at least one good packet is logged and dropped;
/// the packets before it are kept. Fails only if the first packet is bad.
pub fn decode_all(datagram: &Bytes) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset < datagram.len() {
        match decode_prefix(&datagram.slice(offset..)) {
            Ok((packet, used)) => {
                debug!("zcan rx {}", packet);
                packets.push(packet);
                offset += used;
            }
            Err(e) if packets.is_empty() => return Err(e),
            Err(e) => {
                warn!(
                    "zcan: dropping {} malformed trailing bytes: {}",
                    datagram.len() - offset,
                    e
                );
                break;
            }
        }
    }

    Ok(packets)
}

fn target_wire(target: Option<DecoderAddress>) -> u16 {
    target.map_or(SERVICE_TRACK, |a| a.to_wire())
}

fn build(
    sender: u16,
    group: u8,
    command: u8,
    mode: CommandMode,
    payload: Vec<u8>,
) -> Result<Packet> {
    Packet::builder(Transport::Zcan)
        .with_sender(sender)
        .with_group(group)
        .with_command(command)
        .with_mode(mode)
        .with_payload(payload)
        .build()
}

/// Ask station `station` for the state of track output `output`
pub fn power_request(sender: u16, station: u16, output: u8) -> Result<Packet> {
    let mut payload = station.to_le_bytes().to_vec();
    payload.push(output);
    build(sender, group::SYSTEM, cmd::POWER, CommandMode::Request, payload)
}

/// Switch track output `output` of station `station`
pub fn power_command(sender: u16, station: u16, output: u8, state: PowerState) -> Result<Packet> {
    let mut payload = station.to_le_bytes().to_vec();
    payload.push(output);
    payload.push(state.as_u8());
    build(sender, group::SYSTEM, cmd::POWER, CommandMode::Command, payload)
}

/// Station report of a track output state
pub fn power_report(
    station: u16,
    mode: CommandMode,
    output: u8,
    state: PowerState,
) -> Result<Packet> {
    let mut payload = station.to_le_bytes().to_vec();
    payload.push(output);
    payload.push(state.as_u8());
    build(station, group::SYSTEM, cmd::POWER, mode, payload)
}

/// Set speed (0..=1023) and direction of a locomotive
pub fn loco_speed_command(
    sender: u16,
    station: u16,
    loco: DecoderAddress,
    speed: u16,
    forward: bool,
    emergency_stop: bool,
) -> Result<Packet> {
    if speed > speed::SPEED_MASK {
        return Err(DccError::malformed(format!(
            "speed {} exceeds {}",
            speed,
            speed::SPEED_MASK
        )));
    }
    let mut word = speed;
    if forward {
        word |= speed::FORWARD;
    }
    if emergency_stop {
        word |= speed::EMERGENCY_STOP;
    }

    let mut payload = station.to_le_bytes().to_vec();
    payload.extend_from_slice(&loco.to_wire().to_le_bytes());
    payload.extend_from_slice(&word.to_le_bytes());
    build(sender, group::VEHICLE, cmd::SPEED, CommandMode::Command, payload)
}

/// Switch one locomotive function
pub fn loco_function_command(
    sender: u16,
    station: u16,
    loco: DecoderAddress,
    function: u16,
    on: bool,
) -> Result<Packet> {
    if usize::from(function) >= FUNCTION_COUNT {
        return Err(DccError::malformed(format!(
            "function F{} out of range [F0, F{}]",
            function,
            FUNCTION_COUNT - 1
        )));
    }
    let mut payload = station.to_le_bytes().to_vec();
    payload.extend_from_slice(&loco.to_wire().to_le_bytes());
    payload.extend_from_slice(&function.to_le_bytes());
    payload.push(u8::from(on));
    build(sender, group::VEHICLE, cmd::FUNCTION, CommandMode::Command, payload)
}

/// Ask for the value of `cv`; `target` `None` reads on the programming track
pub fn cv_read_request(
    sender: u16,
    station: u16,
    target: Option<DecoderAddress>,
    cv: u16,
) -> Result<Packet> {
    let cv = CvAddress::new(cv)?.cv();
    let mut payload = station.to_le_bytes().to_vec();
    payload.extend_from_slice(&target_wire(target).to_le_bytes());
    payload.extend_from_slice(&cv.to_le_bytes());
    build(sender, group::PROGRAMMING, cmd::CV_READ, CommandMode::Request, payload)
}

/// Write `value` into `cv`; `target` `None` writes on the programming track
pub fn cv_write_request(
    sender: u16,
    station: u16,
    target: Option<DecoderAddress>,
    cv: u16,
    value: u8,
) -> Result<Packet> {
    let cv = CvAddress::new(cv)?.cv();
    let mut payload = station.to_le_bytes().to_vec();
    payload.extend_from_slice(&target_wire(target).to_le_bytes());
    payload.extend_from_slice(&cv.to_le_bytes());
    payload.push(value);
    build(sender, group::PROGRAMMING, cmd::CV_WRITE, CommandMode::Command, payload)
}

/// Station answer to a CV read or write
pub fn cv_reply(
    station: u16,
    command: u8,
    target: Option<DecoderAddress>,
    cv: u16,
    value: u8,
    state: CvReadState,
) -> Result<Packet> {
    let cv = CvAddress::new(cv)?.cv();
    let mut payload = station.to_le_bytes().to_vec();
    payload.extend_from_slice(&target_wire(target).to_le_bytes());
    payload.extend_from_slice(&cv.to_le_bytes());
    payload.push(value);
    payload.push(state.as_u8());
    build(station, group::PROGRAMMING, command, CommandMode::Ack, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{CvInfoView, LocoFunctionView, LocoSpeedView, PowerInfoView};

    #[test]
    fn test_command_byte() {
        let byte = CommandByte::new(0x3F, CommandMode::Command);
        assert_eq!(byte.bits(), 0xFD);
        assert_eq!(byte.command(), 0x3F);
        assert_eq!(byte.mode(), CommandMode::Command);

        let byte = CommandByte(0x22);
        assert_eq!(byte.command(), 0x08);
        assert_eq!(byte.mode(), CommandMode::Event);
    }

    #[test]
    fn test_header_layout() -> Result<()> {
        let packet = build(0xC2FF, 0x00, 0x3F, CommandMode::Command, vec![0x01, 0x02])?;
        let wire = encode(&packet)?;
        assert_eq!(
            wire,
            vec![0x02, 0x00, 0x00, 0x00, 0x00, 0xFD, 0xFF, 0xC2, 0x01, 0x02]
        );
        Ok(())
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let packet = cv_read_request(0xC2FF, 0x1234, DecoderAddress::short(3), 29)?;
        let wire = Bytes::from(encode(&packet)?);
        let decoded = decode(&wire)?;
        assert!(decoded.content_eq(&packet));
        assert_eq!(encode(&decoded)?, wire.to_vec());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_short_buffers() {
        assert!(matches!(
            decode(&Bytes::from_static(&[0x00; 7])),
            Err(DccError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode(&Bytes::from_static(&[0x04, 0x00, 0, 0, 0, 0, 0, 0, 0x01, 0x02])),
            Err(DccError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut wire = vec![0x0D, 0x00, 0, 0, 0, 0, 0, 0];
        wire.extend_from_slice(&[0u8; 13]);
        assert!(matches!(
            decode(&Bytes::from(wire)),
            Err(DccError::PayloadTooLarge { len: 13, max: 12 })
        ));
    }

    #[test]
    fn test_decode_all() -> Result<()> {
        let mut datagram = encode(&power_request(1, 2, 0)?)?;
        encode_into(&power_report(2, CommandMode::Ack, 0, PowerState::On)?, &mut datagram)?;

        let packets = decode_all(&Bytes::from(datagram.clone()))?;
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].mode(), CommandMode::Request);
        let view: PowerInfoView = packets[1].adapter().expect("power");
        assert_eq!(view.state(), PowerState::On);

        // a truncated trailing packet is dropped, the good ones survive
        datagram.push(0x05);
        let packets = decode_all(&Bytes::from(datagram))?;
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].mode(), CommandMode::Ack);

        // nothing to salvage when the first packet is already short
        assert!(matches!(
            decode_all(&Bytes::from(vec![0x05, 0x00, 0x00])),
            Err(DccError::MalformedPacket(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_mx1_packet() -> Result<()> {
        let packet = Packet::builder(Transport::Mx1).build()?;
        assert!(encode(&packet).is_err());
        Ok(())
    }

    #[test]
    fn test_cv_reply_view() -> Result<()> {
        let reply = cv_reply(
            0xC2FF,
            cmd::CV_WRITE,
            DecoderAddress::long(1234),
            17,
            0xC4,
            CvReadState::Ok,
        )?;
        let wire = Bytes::from(encode(&reply)?);
        let view: CvInfoView = decode(&wire)?.adapter().expect("cv info");
        assert_eq!(view.network_id(), Some(0xC2FF));
        assert_eq!(view.decoder_address(), DecoderAddress::long(1234));
        assert_eq!(view.cv_number(), 17);
        assert_eq!(view.cv_value(), 0xC4);
        Ok(())
    }

    #[test]
    fn test_loco_builders() -> Result<()> {
        let loco = DecoderAddress::Long(1234);
        assert!(loco_speed_command(1, 2, loco, 1024, true, false).is_err());
        assert!(loco_function_command(1, 2, loco, 29, true).is_err());

        // reflect a command back as a station event to check the layout
        let sent = loco_speed_command(1, 2, loco, 1000, false, true)?;
        let event = build(
            2,
            group::VEHICLE,
            cmd::SPEED,
            CommandMode::Event,
            sent.payload().to_vec(),
        )?;
        let view: LocoSpeedView = event.adapter().expect("speed");
        assert_eq!(view.loco_address(), Some(loco));
        assert_eq!(view.speed(), 1000);
        assert!(!view.forward());
        assert!(view.emergency_stop());

        let sent = loco_function_command(1, 2, loco, 12, true)?;
        let event = build(
            2,
            group::VEHICLE,
            cmd::FUNCTION,
            CommandMode::Event,
            sent.payload().to_vec(),
        )?;
        let view: LocoFunctionView = event.adapter().expect("function");
        assert_eq!(view.function(), 12);
        assert!(view.is_on());
        Ok(())
    }
}
