//! Data-Link Transport for Register-Bus Secure Elements
//!
//! This crate turns the raw, half-duplex frame bus of a discrete secure
//! element into a reliable, ordered message pipe:
//! - Frame codec: control byte, big-endian length, 16-bit frame check
//!   sequence (a fixed nonlinear check, reproduced bit-exactly)
//! - Data-link session: stop-and-wait ARQ with mod-4 sequence numbers,
//!   duplicate-ack tolerance and the device's spontaneous-acknowledge quirk
//! - Network/transport layer: one PCTR multiplexing byte with
//!   single/first/intermediate/last chaining for large messages
//!
//! The physical transaction layer is abstracted behind [`FrameBus`]; the
//! orchestration above (queueing, recovery, power management) lives in the
//! `trustlink` crate.

pub mod bus;
pub mod datalink;
pub mod error;
pub mod frame;
pub mod nettran;

// Re-export commonly used types
pub use bus::{BusStatus, FrameBus, STATUS_BUSY, STATUS_RESPONSE_READY};
pub use datalink::DataLink;
pub use error::{Error, Result};
pub use frame::{FrameKind, FrameRef, SeqCtl};
pub use nettran::Nettran;
