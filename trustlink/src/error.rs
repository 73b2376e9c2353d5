//! Driver error types and APDU completion values

use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the driver.
///
/// Transport and handshake faults reach callers only as the completion value
/// of the APDU that hit them (the worker converts them into recovery state
/// transitions internally). Device-reported error codes are not in this
/// enum — they are a valid [`ApduOutcome`], never an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A data-link or bus fault
    #[error("transport failure: {0}")]
    Transport(#[from] trustlink_transport::Error),

    /// The shielded-connection handshake failed
    #[error("shielded-connection handshake failed")]
    HandshakeFailed,

    /// A shield key load is already in progress or the channel is active
    #[error("shielded-connection key load not possible in the current state")]
    AlreadyInProgress,

    /// The shielded-connection capability is not compiled in or not installed
    #[error("shielded connection not supported")]
    NotSupported,

    /// The shield collaborator rejected the pre-shared key
    #[error("invalid shield key")]
    InvalidKey,

    /// The device answered a management command with malformed bytes
    #[error("unexpected response from device")]
    UnexpectedResponse,

    /// The request was dropped because the device was reset; any
    /// session-bound state it relied on is gone
    #[error("request aborted by device reset")]
    DeviceReset,

    /// The recovery bound was exhausted; the device is out of service until
    /// it is re-initialized
    #[error("device recovery limit reached")]
    ExhaustedRetries,

    /// Invalid driver configuration, reported before the worker starts
    #[error("driver configuration error: {0}")]
    Config(String),
}

/// Final value of one APDU exchange.
///
/// A device-reported error code is a *successful* exchange from the
/// transport's point of view: the command reached the chip and the chip
/// answered. Only genuine driver faults use [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApduOutcome {
    /// The device accepted the command; the full response APDU bytes
    Ok(Vec<u8>),

    /// The device rejected the command with this application error code
    DeviceError(u8),
}

/// What an [`crate::ApduHandle`] resolves to
pub type ApduResult = core::result::Result<ApduOutcome, Error>;
