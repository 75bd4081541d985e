//! MX1 frame envelope and command set
//!
//! A de-escaped MX1 frame is laid out as:
//!
//! ```text
//! ┌──────────┬───────────────┬─────────┬────────────┬──────────────┐
//! │ sequence │ flags | mode  │ command │ payload    │ CRC          │
//! │ 1 byte   │ 1 byte        │ 1 byte  │ 0..N bytes │ 1 or 2 bytes │
//! └──────────┴───────────────┴─────────┴────────────┴──────────────┘
//! ```
//!
//! The CRC covers every byte before it. Frames with the long-frame flag set
//! carry a 16-bit trailer (low byte first), all others an 8-bit one.
//! Payload fields are big-endian.

use bytes::Bytes;
use log::debug;

use crate::address::{CvAddress, DecoderAddress};
use crate::config::LinkConfig;
use crate::crc::{CrcAlgorithm, MX1_CRC16, MX1_CRC8};
use crate::error::{DccError, Result};
use crate::framer;
use crate::limits::FUNCTION_COUNT;
use crate::packet::{CommandMode, Packet, PacketFlags, Transport};
use crate::view::{CvReadState, PowerState};

/// Sequence, flags and command bytes
pub const HEADER_LEN: usize = 3;

/// Decoder field value addressing the programming track
pub const SERVICE_TRACK: u16 = 0;

/// MX1 command codes
pub mod cmd {
    /// Query or switch track power
    pub const TRACK_POWER: u8 = 0x01;
    /// Locomotive speed and direction
    pub const LOCO_SPEED: u8 = 0x02;
    /// Locomotive function on/off
    pub const LOCO_FUNCTION: u8 = 0x04;
    /// Read one CV (service track or programming on main)
    pub const CV_READ: u8 = 0x13;
    /// Write one CV (service track or programming on main)
    pub const CV_WRITE: u8 = 0x14;
}

/// Bits of the MX1 direction byte and speed limits
pub mod speed {
    /// Highest speed step
    pub const MAX_STEP: u8 = 126;
    /// Direction of travel is forward
    pub const FORWARD: u8 = 0x20;
    /// Emergency stop requested or active
    pub const EMERGENCY_STOP: u8 = 0x01;
}

/// Converts packets to and from de-escaped MX1 frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mx1Codec {
    crc8: CrcAlgorithm,
    crc16: CrcAlgorithm,
}

impl Mx1Codec {
    /// Codec using the CRC seeds from `config`
    pub fn new(config: &LinkConfig) -> Self {
        Mx1Codec {
            crc8: MX1_CRC8.with_seed(u32::from(config.crc_seed8)),
            crc16: MX1_CRC16.with_seed(u32::from(config.crc_seed16)),
        }
    }

    fn algorithm(&self, flags: PacketFlags) -> &CrcAlgorithm {
        if flags.long_frame() {
            &self.crc16
        } else {
            &self.crc8
        }
    }

    /// Marshal a packet into a frame body with CRC trailer, not yet escaped
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        if packet.transport() != Transport::Mx1 {
            return Err(DccError::malformed(format!(
                "cannot send {} packet over MX1",
                packet.transport()
            )));
        }
        let sequence = u8::try_from(packet.sender())
            .map_err(|_| DccError::malformed("MX1 sequence exceeds 8 bits"))?;

        let algo = self.algorithm(packet.flags());
        let mut frame = Vec::with_capacity(HEADER_LEN + packet.len() + algo.trailer_len);
        frame.push(sequence);
        frame.push(packet.flags().bits() | packet.mode().bits());
        frame.push(packet.command());
        frame.extend_from_slice(packet.payload());
        algo.append_trailer(&mut frame);
        Ok(frame)
    }

    /// Marshal, escape and wrap a packet ready for the serial line
    pub fn encode_wire(&self, packet: &Packet) -> Result<Vec<u8>> {
        Ok(framer::wrap(&self.encode(packet)?))
    }

    /// Validate the CRC of a de-escaped frame and interpret it
    pub fn decode(&self, frame: Bytes) -> Result<Packet> {
        if frame.len() < HEADER_LEN + 1 {
            return Err(DccError::truncated(HEADER_LEN + 1, frame.len()));
        }

        let flag_byte = frame[1];
        let flags = PacketFlags::from_wire(flag_byte);
        let algo = self.algorithm(flags);
        let body_len = algo.verify_trailer(&frame)?.len();
        if body_len < HEADER_LEN {
            return Err(DccError::truncated(HEADER_LEN + algo.trailer_len, frame.len()));
        }

        let packet = Packet::from_wire(
            Transport::Mx1,
            u16::from(frame[0]),
            0,
            CommandMode::from_bits(flag_byte),
            frame[2],
            flags,
            frame.slice(HEADER_LEN..body_len),
        )?;
        debug!("mx1 rx {}", packet);
        Ok(packet)
    }
}

impl Default for Mx1Codec {
    fn default() -> Self {
        Mx1Codec {
            crc8: MX1_CRC8,
            crc16: MX1_CRC16,
        }
    }
}

fn target_wire(target: Option<DecoderAddress>) -> u16 {
    target.map_or(SERVICE_TRACK, |a| a.to_wire())
}

fn cv_number(cv: u16) -> Result<u16> {
    Ok(CvAddress::new(cv)?.cv())
}

fn build(sequence: u8, mode: CommandMode, command: u8, payload: Vec<u8>) -> Result<Packet> {
    Packet::builder(Transport::Mx1)
        .with_sender(u16::from(sequence))
        .with_mode(mode)
        .with_command(command)
        .with_payload(payload)
        .build()
}

/// Ask for the value of `cv`; `target` `None` reads on the programming track
pub fn cv_read_request(sequence: u8, target: Option<DecoderAddress>, cv: u16) -> Result<Packet> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&target_wire(target).to_be_bytes());
    payload.extend_from_slice(&cv_number(cv)?.to_be_bytes());
    build(sequence, CommandMode::Request, cmd::CV_READ, payload)
}

/// Write `value` into `cv`; `target` `None` writes on the programming track
pub fn cv_write_request(
    sequence: u8,
    target: Option<DecoderAddress>,
    cv: u16,
    value: u8,
) -> Result<Packet> {
    let mut payload = Vec::with_capacity(5);
    payload.extend_from_slice(&target_wire(target).to_be_bytes());
    payload.extend_from_slice(&cv_number(cv)?.to_be_bytes());
    payload.push(value);
    build(sequence, CommandMode::Command, cmd::CV_WRITE, payload)
}

/// Station answer to a CV read or write
pub fn cv_reply(
    sequence: u8,
    command: u8,
    target: Option<DecoderAddress>,
    cv: u16,
    value: u8,
    state: CvReadState,
) -> Result<Packet> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&target_wire(target).to_be_bytes());
    payload.extend_from_slice(&cv_number(cv)?.to_be_bytes());
    payload.push(value);
    payload.push(state.as_u8());
    station(sequence, CommandMode::Ack, command, payload)
}

/// Ask for the current track power state
pub fn power_request(sequence: u8) -> Result<Packet> {
    build(sequence, CommandMode::Request, cmd::TRACK_POWER, Vec::new())
}

/// Switch track power
pub fn power_command(sequence: u8, state: PowerState) -> Result<Packet> {
    build(sequence, CommandMode::Command, cmd::TRACK_POWER, vec![state.as_u8()])
}

/// Station report of the track power state
pub fn power_report(sequence: u8, mode: CommandMode, state: PowerState) -> Result<Packet> {
    station(sequence, mode, cmd::TRACK_POWER, vec![state.as_u8()])
}

/// Set speed and direction of a locomotive
pub fn loco_speed_command(
    sequence: u8,
    loco: DecoderAddress,
    speed_step: u8,
    forward: bool,
    emergency_stop: bool,
) -> Result<Packet> {
    if speed_step > speed::MAX_STEP {
        return Err(DccError::malformed(format!(
            "speed step {} exceeds {}",
            speed_step,
            speed::MAX_STEP
        )));
    }
    let mut direction = 0;
    if forward {
        direction |= speed::FORWARD;
    }
    if emergency_stop {
        direction |= speed::EMERGENCY_STOP;
    }

    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&loco.to_wire().to_be_bytes());
    payload.push(speed_step);
    payload.push(direction);
    build(sequence, CommandMode::Command, cmd::LOCO_SPEED, payload)
}

/// Switch one locomotive function
pub fn loco_function_command(
    sequence: u8,
    loco: DecoderAddress,
    function: u8,
    on: bool,
) -> Result<Packet> {
    if usize::from(function) >= FUNCTION_COUNT {
        return Err(DccError::malformed(format!(
            "function F{} out of range [F0, F{}]",
            function,
            FUNCTION_COUNT - 1
        )));
    }
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&loco.to_wire().to_be_bytes());
    payload.push(function);
    payload.push(u8::from(on));
    build(sequence, CommandMode::Command, cmd::LOCO_FUNCTION, payload)
}

fn station(sequence: u8, mode: CommandMode, command: u8, payload: Vec<u8>) -> Result<Packet> {
    let mut flags = PacketFlags::default();
    flags.set_from_station(true);
    Packet::builder(Transport::Mx1)
        .with_sender(u16::from(sequence))
        .with_mode(mode)
        .with_command(command)
        .with_flags(flags)
        .with_payload(payload)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{CvInfoView, LocoSpeedView, PowerInfoView};

    #[test]
    fn test_encode_short_frame_layout() -> Result<()> {
        let packet = cv_read_request(5, DecoderAddress::short(3), 29)?;
        let frame = Mx1Codec::default().encode(&packet)?;

        assert_eq!(&frame[..7], &[0x05, 0x00, cmd::CV_READ, 0x00, 0x03, 0x00, 0x1D]);
        assert_eq!(frame.len(), 8);
        assert_eq!(MX1_CRC8.checksum(&frame), 0);
        Ok(())
    }

    #[test]
    fn test_decode_roundtrip() -> Result<()> {
        let codec = Mx1Codec::default();
        let packet = cv_write_request(200, DecoderAddress::long(1234), 1, 0x07)?;

        let decoded = codec.decode(Bytes::from(codec.encode(&packet)?))?;
        assert!(decoded.content_eq(&packet));
        assert_eq!(decoded.sender(), 200);
        assert_eq!(decoded.mode(), CommandMode::Command);
        Ok(())
    }

    #[test]
    fn test_long_frame_uses_crc16() -> Result<()> {
        let codec = Mx1Codec::default();
        let packet = Packet::builder(Transport::Mx1)
            .with_sender(1)
            .with_command(0x30)
            .with_payload(vec![0xAA; 100])
            .build()?;

        let frame = codec.encode(&packet)?;
        assert_eq!(frame.len(), HEADER_LEN + 100 + 2);
        assert_eq!(frame[1] & 0x80, 0x80);

        let decoded = codec.decode(Bytes::from(frame))?;
        assert!(decoded.content_eq(&packet));
        Ok(())
    }

    #[test]
    fn test_corrupt_frame_rejected() -> Result<()> {
        let codec = Mx1Codec::default();
        let mut frame = codec.encode(&cv_read_request(1, None, 8)?)?;
        frame[4] ^= 0x01;
        assert!(matches!(
            codec.decode(Bytes::from(frame)),
            Err(DccError::CrcMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_short_frames_rejected() {
        let codec = Mx1Codec::default();
        assert!(matches!(
            codec.decode(Bytes::from_static(&[0x01, 0x00])),
            Err(DccError::Truncated { .. })
        ));

        // long flag with only three bytes total leaves no header
        let mut frame = vec![0x01, 0x80];
        MX1_CRC16.append_trailer(&mut frame);
        assert!(codec.decode(Bytes::from(frame)).is_err());
    }

    #[test]
    fn test_seeded_codec_disagrees_with_default() -> Result<()> {
        let config = LinkConfig::builder().with_crc_seed8(0x00).build();
        let seeded = Mx1Codec::new(&config);
        let frame = seeded.encode(&power_request(9)?)?;

        assert!(seeded.decode(Bytes::from(frame.clone())).is_ok());
        assert!(Mx1Codec::default().decode(Bytes::from(frame)).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_zcan_packet() -> Result<()> {
        let packet = Packet::builder(Transport::Zcan).build()?;
        assert!(Mx1Codec::default().encode(&packet).is_err());
        Ok(())
    }

    #[test]
    fn test_station_replies_have_views() -> Result<()> {
        let reply = cv_reply(5, cmd::CV_READ, DecoderAddress::short(3), 29, 0x0E, CvReadState::Ok)?;
        assert!(reply.flags().from_station());
        let view: CvInfoView = reply.adapter().expect("cv info");
        assert_eq!(view.cv_value(), 0x0E);

        let power = power_report(6, CommandMode::Event, PowerState::Overload)?;
        let view: PowerInfoView = power.adapter().expect("power");
        assert_eq!(view.state(), PowerState::Overload);
        Ok(())
    }

    #[test]
    fn test_loco_command_validation() -> Result<()> {
        let loco = DecoderAddress::Short(3);
        assert!(loco_speed_command(1, loco, 127, true, false).is_err());
        assert!(loco_function_command(1, loco, 29, true).is_err());

        let cmd = loco_speed_command(1, loco, 64, true, false)?;
        assert_eq!(cmd.payload().as_ref(), &[0x00, 0x03, 64, speed::FORWARD]);
        // commands are not reports, so no view applies
        assert!(cmd.adapter::<LocoSpeedView>().is_none());

        assert!(cv_read_request(1, None, 0).is_err());
        assert!(cv_read_request(1, None, 1025).is_err());
        Ok(())
    }
}
