//! Error types for the MX1 and ZCAN protocol layer

use thiserror::Error;

/// Result type for DCC link operations
pub type Result<T> = std::result::Result<T, DccError>;

/// Errors surfaced by the codecs, the framer and the link drivers
#[derive(Error, Debug)]
pub enum DccError {
    /// Packet header or payload does not follow the wire layout
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Payload longer than the transport allows
    #[error("Payload of {len} bytes exceeds transport maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A field read ran past the end of the payload
    #[error("Truncated payload: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Frame trailer does not match the recomputed checksum
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Byte stream lost synchronisation with the frame markers
    #[error("Framing error: {0}")]
    Framing(String),

    /// Address or CV number outside its legal range
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Input text is not a sequence of hex bytes
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// Operation not allowed in the current programming mode
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// The command station reported a failed CV access
    #[error("CV access failed: {0}")]
    CvAccess(String),

    /// Link configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Underlying serial port or socket failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply arrived before the deadline
    #[error("Timed out waiting for reply")]
    Timeout,

    /// The pending request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// The link was closed while the request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,
}

impl DccError {
    /// Create a new MalformedPacket error
    pub fn malformed(msg: impl Into<String>) -> Self {
        DccError::MalformedPacket(msg.into())
    }

    /// Create a new Framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        DccError::Framing(msg.into())
    }

    /// Create a new InvalidAddress error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        DccError::InvalidAddress(msg.into())
    }

    /// Create a new InvalidHex error
    pub fn invalid_hex(msg: impl Into<String>) -> Self {
        DccError::InvalidHex(msg.into())
    }

    /// Create a new InvalidMode error
    pub fn invalid_mode(msg: impl Into<String>) -> Self {
        DccError::InvalidMode(msg.into())
    }

    /// Create a new CvAccess error
    pub fn cv_access(msg: impl Into<String>) -> Self {
        DccError::CvAccess(msg.into())
    }

    /// Create a new Config error
    pub fn config(msg: impl Into<String>) -> Self {
        DccError::Config(msg.into())
    }

    /// Create a Truncated error for a read of `needed` bytes
    pub fn truncated(needed: usize, available: usize) -> Self {
        DccError::Truncated { needed, available }
    }

    /// Whether this error ends the connection rather than a single exchange
    pub fn is_fatal(&self) -> bool {
        matches!(self, DccError::Io(_) | DccError::ConnectionClosed)
    }
}
