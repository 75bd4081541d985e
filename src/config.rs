//! Link configuration

use std::time::Duration;

use crate::error::{DccError, Result};

/// Default maximum de-escaped MX1 frame size: 1500 payload bytes, 3 header
/// bytes and a 2-byte CRC
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1505;

/// Default time to wait for a station reply
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 2000;

/// Default network id used as ZCAN sender
pub const DEFAULT_SENDER_ID: u16 = 0xC2FF;

/// Settings shared by the MX1 and ZCAN links
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkConfig {
    /// Frames longer than this are discarded by the framer
    pub max_frame_size: usize,
    /// How long a request waits for its reply
    pub reply_timeout_ms: u64,
    /// Sender id stamped on outgoing ZCAN packets
    pub sender_id: u16,
    /// Network id of the ZCAN command station requests are addressed to
    pub station_id: u16,
    /// Initial value of the MX1 CRC-8
    pub crc_seed8: u8,
    /// Initial value of the MX1 CRC-16
    pub crc_seed16: u16,
}

impl LinkConfig {
    /// Start from the defaults
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::new()
    }

    /// Reply timeout as a [`Duration`]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Reject settings no link can run with
    pub fn validate(&self) -> Result<()> {
        // header plus the shortest trailer
        if self.max_frame_size < 4 {
            return Err(DccError::config(format!(
                "max_frame_size {} cannot hold a frame header",
                self.max_frame_size
            )));
        }
        if self.reply_timeout_ms == 0 {
            return Err(DccError::config("reply_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields keep their defaults
    #[cfg(feature = "serde")]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: LinkConfig =
            serde_json::from_str(text).map_err(|e| DccError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            sender_id: DEFAULT_SENDER_ID,
            station_id: 0,
            crc_seed8: 0xFF,
            crc_seed16: 0xFFFF,
        }
    }
}

/// Builder for [`LinkConfig`]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a new builder holding the defaults
    pub fn new() -> Self {
        LinkConfigBuilder {
            config: LinkConfig::default(),
        }
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the reply timeout
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the ZCAN sender id
    pub fn with_sender_id(mut self, id: u16) -> Self {
        self.config.sender_id = id;
        self
    }

    /// Set the ZCAN command station id
    pub fn with_station_id(mut self, id: u16) -> Self {
        self.config.station_id = id;
        self
    }

    /// Set the CRC-8 seed
    pub fn with_crc_seed8(mut self, seed: u8) -> Self {
        self.config.crc_seed8 = seed;
        self
    }

    /// Set the CRC-16 seed
    pub fn with_crc_seed16(mut self, seed: u16) -> Self {
        self.config.crc_seed16 = seed;
        self
    }

    /// Build the configuration
    pub fn build(self) -> LinkConfig {
        self.config
    }
}

impl Default for LinkConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
