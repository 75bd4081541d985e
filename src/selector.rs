//! Packet selectors
//!
//! A selector decides whether a packet belongs to a given
//! (transport, group, command, mode) class and is long enough to be read.

use crate::packet::{CommandMode, Packet, Transport};

/// Anything that can accept or reject a packet
pub trait Selector: Send + Sync {
    /// Check if `packet` is accepted
    fn matches(&self, packet: &Packet) -> bool;
}

impl<F> Selector for F
where
    F: Fn(&Packet) -> bool + Send + Sync,
{
    fn matches(&self, packet: &Packet) -> bool {
        self(packet)
    }
}

/// Matcher over one (transport, group, command, mode) tuple with a minimum
/// payload length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketSelector {
    /// Transport the packet arrived on
    pub transport: Transport,
    /// Command group (0 on MX1)
    pub group: u8,
    /// Command code
    pub command: u8,
    /// Command mode
    pub mode: CommandMode,
    /// Minimum payload length
    pub min_len: usize,
}

impl PacketSelector {
    /// Selector for a ZCAN group/command pair
    pub const fn zcan(group: u8, command: u8, mode: CommandMode, min_len: usize) -> Self {
        PacketSelector {
            transport: Transport::Zcan,
            group,
            command,
            mode,
            min_len,
        }
    }

    /// Selector for an MX1 command
    pub const fn mx1(command: u8, mode: CommandMode, min_len: usize) -> Self {
        PacketSelector {
            transport: Transport::Mx1,
            group: 0,
            command,
            mode,
            min_len,
        }
    }

    /// Check if both selectors can match the same packet
    ///
    /// Minimum lengths never separate two selectors, since a long enough
    /// payload satisfies both.
    pub fn overlaps(&self, other: &PacketSelector) -> bool {
        self.transport == other.transport
            && self.group == other.group
            && self.command == other.command
            && self.mode == other.mode
    }
}

impl Selector for PacketSelector {
    fn matches(&self, packet: &Packet) -> bool {
        packet.transport() == self.transport
            && packet.group() == self.group
            && packet.command() == self.command
            && packet.mode() == self.mode
            && packet.len() >= self.min_len
    }
}

/// OR-combination of selectors: matches if any inner selector matches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorSet {
    selectors: Vec<PacketSelector>,
}

impl SelectorSet {
    /// Create an empty set (matches nothing)
    pub fn new() -> Self {
        SelectorSet::default()
    }

    /// Add a selector
    pub fn with(mut self, selector: PacketSelector) -> Self {
        self.selectors.push(selector);
        self
    }

    /// Inner selectors
    pub fn selectors(&self) -> &[PacketSelector] {
        &self.selectors
    }

    /// Check if any selector of `self` overlaps any selector of `other`
    pub fn overlaps(&self, other: &SelectorSet) -> Option<(PacketSelector, PacketSelector)> {
        self.selectors.iter().find_map(|a| {
            other
                .selectors
                .iter()
                .find(|b| a.overlaps(b))
                .map(|b| (*a, *b))
        })
    }
}

impl From<PacketSelector> for SelectorSet {
    fn from(selector: PacketSelector) -> Self {
        SelectorSet::new().with(selector)
    }
}

impl FromIterator<PacketSelector> for SelectorSet {
    fn from_iter<I: IntoIterator<Item = PacketSelector>>(iter: I) -> Self {
        SelectorSet {
            selectors: iter.into_iter().collect(),
        }
    }
}

impl Selector for SelectorSet {
    fn matches(&self, packet: &Packet) -> bool {
        self.selectors.iter().any(|s| s.matches(packet))
    }
}
