//! # DCC command station link
//!
//! Protocol layer for talking to model-railway DCC command stations over two
//! transports:
//!
//! - **MX1**: a serial point-to-point link. Frames are `SOH SOH <body> EOT`
//!   with byte stuffing and a CRC-8 or CRC-16 trailer.
//! - **ZCAN**: CAN-derived packets with an 8-byte little-endian header,
//!   carried in UDP datagrams.
//!
//! Both decode into the same [`Packet`] model. Typed views ([`CvInfoView`],
//! [`PowerInfoView`], ...) read fields out of a packet's payload, and
//! [`ReplyCorrelator`] matches requests to their replies with exactly-once
//! completion. [`Mx1Link`] and [`ZcanLink`] drive a connection with one
//! reader thread each; [`Programmer`] reads and writes decoder CVs on top.
//!
//! ## Features
//!
//! - `serde`: Enable serialization of value types and JSON link configuration
//!
//! ## Example
//!
//! ```
//! use dcc_link::{mx1, DecoderAddress, Framer, FramerEvent, Mx1Codec};
//!
//! let codec = Mx1Codec::default();
//! let request = mx1::cv_read_request(1, DecoderAddress::short(3), 29)?;
//! let wire = codec.encode_wire(&request)?;
//!
//! let mut framer = Framer::new(1505);
//! for event in framer.push(&wire) {
//!     if let FramerEvent::Frame(frame) = event {
//!         let decoded = codec.decode(frame)?;
//!         assert!(decoded.content_eq(&request));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod address;
pub mod config;
pub mod correlator;
pub mod crc;
pub mod dispatch;
pub mod error;
pub mod framer;
pub mod hex;
pub mod mx1;
pub mod packet;
pub mod programmer;
pub mod selector;
pub mod transport;
pub mod view;
pub mod zcan;

pub use address::{Cv29, CvAddress, DecoderAddress};
pub use config::{LinkConfig, LinkConfigBuilder};
pub use correlator::{PendingReply, ReplyCanceller, ReplyCorrelator};
pub use dispatch::{Dispatcher, LinkEvent, ListenerId};
pub use error::{DccError, Result};
pub use framer::{FrameState, Framer, FramerEvent};
pub use mx1::Mx1Codec;
pub use packet::{CommandMode, Packet, PacketBuilder, PacketFlags, Transport};
pub use programmer::{
    identify_decoder, CvLink, CvProvider, DecoderInfo, Programmer, ProgrammingMode,
};
pub use selector::{PacketSelector, Selector, SelectorSet};
pub use transport::{
    ByteSink, ByteSource, DatagramSource, Mx1Link, PacketSink, ReadSource, ZcanLink,
};
pub use view::{
    AdapterRegistry, CvInfoView, CvReadState, LocoFunctionView, LocoSpeedView, PacketView,
    PowerInfoView, PowerState, View, ViewKind,
};

/// DCC and transport limits
pub mod limits {
    /// Highest locomotive or consist address
    pub const ADDRESS_MAX: u16 = 10239;

    /// Highest short (CV1) address
    pub const SHORT_ADDRESS_MAX: u8 = 127;

    /// Lowest CV number
    pub const CV_MIN: u16 = 1;

    /// Highest CV number
    pub const CV_MAX: u16 = 1024;

    /// Number of locomotive functions, F0..=F28
    pub const FUNCTION_COUNT: usize = 29;

    /// ZCAN payload limit (CAN frame bytes plus extension)
    pub const ZCAN_MAX_PAYLOAD: usize = 12;

    /// Largest 6-bit ZCAN command
    pub const ZCAN_MAX_COMMAND: u8 = 0x3F;

    /// MX1 payload limit
    pub const MX1_MAX_PAYLOAD: usize = 1500;

    /// Largest payload that still fits a short (CRC-8) MX1 frame
    pub const MX1_SHORT_FRAME_MAX_PAYLOAD: usize = 64;
}
