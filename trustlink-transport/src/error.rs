//! Transport layer error types

use thiserror::Error;

/// Transport layer result type
pub type Result<T> = core::result::Result<T, Error>;

/// Faults raised by the data-link and network layers.
///
/// Every variant is a transport fault: the orchestration layer above treats
/// all of them as grounds for a device reset. Device-reported application
/// error codes are *not* represented here — they travel back to callers as a
/// normal APDU outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The frame check sequence did not match the received bytes
    #[error("frame checksum mismatch")]
    Checksum,

    /// Fewer bytes than the minimum (control) frame size were received
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// The device acknowledged a frame number that is neither the
    /// outstanding one nor a repeat of the last acknowledged one
    #[error("unexpected acknowledge number")]
    UnexpectedAck,

    /// A frame of the wrong type arrived (control where data was expected,
    /// NAK/RESET sequence control, or a malformed chain marker)
    #[error("unexpected frame type")]
    UnexpectedFrameType,

    /// The frame length field disagrees with the received byte count
    #[error("frame length field mismatch")]
    BadLength,

    /// The payload does not fit the negotiated frame buffer
    #[error("payload too large for negotiated frame size")]
    FrameTooLarge,

    /// The received message does not fit the caller's buffer
    #[error("response larger than caller buffer")]
    Overflow,

    /// The underlying bus transaction failed
    #[error("bus transaction failed: {0}")]
    Bus(String),
}
