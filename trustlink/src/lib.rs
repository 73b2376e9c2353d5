//! # trustlink
//!
//! Host-side driver core for a discrete secure-element chip behind a narrow,
//! unreliable, half-duplex register bus.
//!
//! The crate turns arbitrary command/response exchanges (APDUs) into framed,
//! acknowledged, checksummed bus transactions and hides the chip's fragility
//! from callers:
//!
//! - **Single worker**: one dedicated thread owns the bus and executes APDUs
//!   strictly in enqueue order, one at a time.
//! - **Bounded recovery**: transport faults trigger an automatic stack reset
//!   and application reopen, up to a configured bound; past the bound the
//!   driver locks out and every request fails fast.
//! - **Power management**: with a power switch wired up, an idle chip is
//!   hibernated (application context saved when reserved sessions need it)
//!   and woken transparently on the next request.
//! - **Session reservations**: lock-free slot registry callers use to pin
//!   chip-side session contexts while they depend on them.
//! - **Shielded connection** (feature `shield`): sequencing for the
//!   encrypted-channel handshake; the cryptography itself is supplied by an
//!   external [`ShieldSession`] collaborator.
//!
//! Framing, checksums and the stop-and-wait ARQ live in
//! [`trustlink_transport`]; implement its [`FrameBus`] trait to bind the
//! driver to a concrete bus.
//!
//! ## Example
//!
//! ```no_run
//! use trustlink::{Apdu, Options, SecureElement};
//! # fn example(bus: impl trustlink::FrameBus + Send + 'static) -> trustlink::Result<()> {
//! let element = SecureElement::start(bus, Options::default())?;
//!
//! // Read the coprocessor UID data object
//! let (apdu, handle) = Apdu::new([0x81, 0x00, 0x00, 0x02, 0xE0, 0xC2], 1024);
//! element.enqueue(apdu);
//!
//! match handle.wait()? {
//!     trustlink::ApduOutcome::Ok(response) => println!("UID: {:02X?}", &response[4..]),
//!     trustlink::ApduOutcome::DeviceError(code) => println!("device error {code:#04X}"),
//! }
//! # Ok(())
//! # }
//! ```

mod device;
mod element;
pub mod error;
pub mod request;
pub mod session;
#[cfg(feature = "shield")]
pub mod shield;
mod worker;

// Re-export commonly used types
pub use device::{Options, PowerControl, DEFAULT_HIBERNATE_DELAY, DEFAULT_MAX_RESET};
pub use element::SecureElement;
pub use error::{ApduOutcome, ApduResult, Error, Result};
pub use request::{Apdu, ApduHandle};
pub use session::{HIBERNATE_EXEMPT_SESSIONS, SESSION_SLOTS};
#[cfg(feature = "shield")]
pub use shield::{RawExchange, ShieldSession, ShieldState};

// The bus seam callers implement to bind real hardware
pub use trustlink_transport::{BusStatus, FrameBus};

/// The transport layer, re-exported for bus implementors and tests
pub use trustlink_transport as transport;
