//! Decoder programming
//!
//! [`CvProvider`] is the transport-independent way to read and write CVs.
//! [`Programmer`] implements it over any link that can carry CV requests
//! ([`CvLink`]), tracking whether requests go to the programming track
//! (service mode) or to one decoder on the main track (POM).
//!
//! [`identify_decoder`] reads the registers that describe a decoder.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use log::debug;

use crate::address::{
    consist_direction_inverted, decode_consist_address, decode_long_address, Cv29, CvAddress,
    DecoderAddress,
};
use crate::error::{DccError, Result};
use crate::mx1;
use crate::packet::Packet;
use crate::selector::Selector;
use crate::transport::{Mx1Link, ZcanLink};
use crate::view::{CvInfoView, CvReadState, PacketView};
use crate::zcan;

/// Bank-select registers, in bank index order
pub const BANK_REGISTERS: [u16; 2] = [31, 32];

/// NMRA manufacturer id of ZIMO
pub const MANUFACTURER_ZIMO: u8 = 145;

/// Where CV requests are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProgrammingMode {
    /// Programming track; reaches whichever decoder sits on it
    Service,
    /// Programming on main, addressed to one decoder
    Pom {
        /// Decoder the requests are addressed to
        address: DecoderAddress,
    },
}

impl ProgrammingMode {
    /// Target decoder field for requests; `None` is the programming track
    pub fn target(&self) -> Option<DecoderAddress> {
        match self {
            ProgrammingMode::Service => None,
            ProgrammingMode::Pom { address } => Some(*address),
        }
    }
}

impl fmt::Display for ProgrammingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgrammingMode::Service => write!(f, "SERVICE"),
            ProgrammingMode::Pom { address } => write!(f, "POM {}", address),
        }
    }
}

/// Reads and writes decoder CVs
pub trait CvProvider {
    /// Current programming mode
    fn mode(&self) -> ProgrammingMode;

    /// Switch to the programming track
    fn enter_service_mode(&mut self);

    /// Address `address` on the main track
    ///
    /// Reading back on the main track needs RailCom; without it the switch
    /// is refused with [`DccError::InvalidMode`].
    fn enter_pom_mode(&mut self, address: DecoderAddress, railcom: bool) -> Result<()>;

    /// Read one CV
    fn read_cv(&self, cv: u16) -> impl Future<Output = Result<u8>> + Send;

    /// Write one CV
    fn write_cv(&self, cv: u16, value: u8) -> impl Future<Output = Result<()>> + Send;
}

/// A link that can carry single CV requests and return the station's final
/// answer
pub trait CvLink: Send + Sync {
    /// Read `cv` from `target` (`None`: programming track)
    fn cv_read(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
    ) -> impl Future<Output = Result<CvInfoView>> + Send;

    /// Write `value` into `cv` of `target`
    fn cv_write(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
        value: u8,
    ) -> impl Future<Output = Result<CvInfoView>> + Send;
}

impl<L: CvLink> CvLink for Arc<L> {
    fn cv_read(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
    ) -> impl Future<Output = Result<CvInfoView>> + Send {
        (**self).cv_read(target, cv)
    }

    fn cv_write(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
        value: u8,
    ) -> impl Future<Output = Result<CvInfoView>> + Send {
        (**self).cv_write(target, cv, value)
    }
}

/// Extract the final CV answer for `cv`; `Busy` reports keep the request
/// waiting
fn final_answer(
    cv: u16,
    target: Option<DecoderAddress>,
) -> impl Fn(&Packet) -> Option<CvInfoView> + Send + Sync {
    move |packet: &Packet| {
        packet.adapter::<CvInfoView>().filter(|view| {
            view.cv_number() == cv
                && view.decoder_address() == target
                && view.read_state().is_final()
        })
    }
}

impl CvLink for Mx1Link {
    async fn cv_read(&self, target: Option<DecoderAddress>, cv: u16) -> Result<CvInfoView> {
        let seq = self.next_sequence();
        let request = mx1::cv_read_request(seq, target, cv)?;
        let replies = CvInfoView::selector();
        self.request(
            &request,
            move |p: &Packet| p.sender() == u16::from(seq) && replies.matches(p),
            final_answer(cv, target),
        )
        .await
    }

    async fn cv_write(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
        value: u8,
    ) -> Result<CvInfoView> {
        let seq = self.next_sequence();
        let request = mx1::cv_write_request(seq, target, cv, value)?;
        let replies = CvInfoView::selector();
        self.request(
            &request,
            move |p: &Packet| p.sender() == u16::from(seq) && replies.matches(p),
            final_answer(cv, target),
        )
        .await
    }
}

impl CvLink for ZcanLink {
    async fn cv_read(&self, target: Option<DecoderAddress>, cv: u16) -> Result<CvInfoView> {
        let request = zcan::cv_read_request(
            self.sender_id(),
            self.config().station_id,
            target,
            cv,
        )?;
        self.request(&request, CvInfoView::selector(), final_answer(cv, target))
            .await
    }

    async fn cv_write(
        &self,
        target: Option<DecoderAddress>,
        cv: u16,
        value: u8,
    ) -> Result<CvInfoView> {
        let request = zcan::cv_write_request(
            self.sender_id(),
            self.config().station_id,
            target,
            cv,
            value,
        )?;
        self.request(&request, CvInfoView::selector(), final_answer(cv, target))
            .await
    }
}

fn check_state(view: &CvInfoView, op: &str) -> Result<()> {
    match view.read_state() {
        CvReadState::Ok => Ok(()),
        state => Err(DccError::cv_access(format!(
            "CV{} {}: station reported {:?}",
            view.cv_number(),
            op,
            state
        ))),
    }
}

/// [`CvProvider`] over a [`CvLink`]
pub struct Programmer<L> {
    link: L,
    mode: ProgrammingMode,
}

impl<L: CvLink> Programmer<L> {
    /// Start in service mode
    pub fn new(link: L) -> Self {
        Programmer {
            link,
            mode: ProgrammingMode::Service,
        }
    }

    /// Underlying link
    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: CvLink> CvProvider for Programmer<L> {
    fn mode(&self) -> ProgrammingMode {
        self.mode
    }

    fn enter_service_mode(&mut self) {
        debug!("programmer: {} -> SERVICE", self.mode);
        self.mode = ProgrammingMode::Service;
    }

    fn enter_pom_mode(&mut self, address: DecoderAddress, railcom: bool) -> Result<()> {
        if !railcom {
            return Err(DccError::invalid_mode(format!(
                "programming on main for {} needs RailCom to read back",
                address
            )));
        }
        let next = ProgrammingMode::Pom { address };
        debug!("programmer: {} -> {}", self.mode, next);
        self.mode = next;
        Ok(())
    }

    async fn read_cv(&self, cv: u16) -> Result<u8> {
        let cv = CvAddress::new(cv)?.cv();
        let view = self.link.cv_read(self.mode.target(), cv).await?;
        check_state(&view, "read")?;
        debug!("CV{} = {}", cv, view.cv_value());
        Ok(view.cv_value())
    }

    async fn write_cv(&self, cv: u16, value: u8) -> Result<()> {
        let cv = CvAddress::new(cv)?.cv();
        let view = self.link.cv_write(self.mode.target(), cv, value).await?;
        check_state(&view, "write")?;
        debug!("CV{} := {}", cv, value);
        Ok(())
    }
}

async fn select_banks<P: CvProvider + ?Sized>(provider: &P, address: &CvAddress) -> Result<()> {
    for index in 0..crate::address::BANK_COUNT {
        let Some(value) = address.bank(index) else {
            continue;
        };
        let register = BANK_REGISTERS.get(index).ok_or_else(|| {
            DccError::invalid_address(format!("{}: no bank register for index {}", address, index))
        })?;
        provider.write_cv(*register, value).await?;
    }
    Ok(())
}

/// Read a possibly banked CV, writing its bank registers first
pub async fn read_banked<P: CvProvider + ?Sized>(provider: &P, address: &CvAddress) -> Result<u8> {
    select_banks(provider, address).await?;
    provider.read_cv(address.cv()).await
}

/// Write a possibly banked CV, writing its bank registers first
pub async fn write_banked<P: CvProvider + ?Sized>(
    provider: &P,
    address: &CvAddress,
    value: u8,
) -> Result<()> {
    select_banks(provider, address).await?;
    provider.write_cv(address.cv(), value).await
}

/// Name of an NMRA manufacturer id, for the ones commonly met
pub fn manufacturer_name(id: u8) -> Option<&'static str> {
    match id {
        97 => Some("Doehler & Haass"),
        99 => Some("Lenz"),
        129 => Some("Digitrax"),
        145 => Some("Zimo"),
        151 => Some("ESU"),
        _ => None,
    }
}

/// Registers describing a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DecoderInfo {
    /// Active address, `None` if the address CVs hold an invalid value
    pub address: Option<DecoderAddress>,
    /// Raw CV29 configuration
    pub cv29: u8,
    /// NMRA manufacturer id (CV8)
    pub manufacturer: u8,
    /// Version (CV7)
    pub version: u8,
    /// Consist address (CV19/20), if one is set
    pub consist: Option<u16>,
    /// Consist direction inverted (CV19 bit 7)
    pub consist_inverted: bool,
    /// Decoder serial number (ZIMO: CV250..=253)
    pub serial: Option<u32>,
}

impl DecoderInfo {
    /// CV29 bit view
    pub fn config(&self) -> Cv29 {
        Cv29::from(self.cv29)
    }

    /// Manufacturer name, if known
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        manufacturer_name(self.manufacturer)
    }
}

/// Read the identifying registers of the decoder reachable in the
/// provider's current mode
pub async fn identify_decoder<P: CvProvider + ?Sized>(provider: &P) -> Result<DecoderInfo> {
    let cv29 = provider.read_cv(29).await?;
    let config = Cv29::from(cv29);

    let address = if config.extended_address() {
        let cv17 = provider.read_cv(17).await?;
        let cv18 = provider.read_cv(18).await?;
        decode_long_address(cv17, cv18).and_then(DecoderAddress::long)
    } else {
        let cv1 = provider.read_cv(1).await?;
        DecoderAddress::short(cv1 & 0x7F)
    };

    let manufacturer = provider.read_cv(8).await?;
    let version = provider.read_cv(7).await?;

    let cv19 = provider.read_cv(19).await?;
    let cv20 = provider.read_cv(20).await?;

    let serial = if manufacturer == MANUFACTURER_ZIMO {
        let mut bytes = [0u8; 4];
        for (byte, cv) in bytes.iter_mut().zip(250..=253) {
            *byte = provider.read_cv(cv).await?;
        }
        Some(u32::from_be_bytes(bytes))
    } else {
        None
    };

    let info = DecoderInfo {
        address,
        cv29,
        manufacturer,
        version,
        consist: decode_consist_address(cv19, cv20),
        consist_inverted: consist_direction_inverted(cv19),
        serial,
    };
    debug!(
        "identified {:?} from {} v{}",
        info.address,
        info.manufacturer_name().unwrap_or("unknown"),
        info.version
    );
    Ok(info)
}
