//! Shielded-Connection Gate
//!
//! The encrypted channel ("shield") needs a key-exchange handshake before
//! use. This module owns *when* that happens, not *how*: the cryptographic
//! handshake and AEAD framing belong to an external [`ShieldSession`]
//! collaborator. The gate is a tiny state machine in one atomic; every
//! transition is compare-and-swap guarded, so a caller loading a key and
//! the worker starting a handshake can never race into the same state.
//!
//! ```text
//! Disabled ──start_shield──> LoadingKey ──ok──> KeyLoaded
//!                                │ err               │ worker pre-check
//!                                └──> (revert)        v
//!                            Enabled <──ok── Handshake ──err──> KeyLoaded
//!                                │
//!                  rehandshake / reset / failed save
//!                                └────────────> KeyLoaded
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// State of the shielded channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShieldState {
    /// No key installed, channel inactive
    Disabled = 0,

    /// A caller is installing the pre-shared key
    LoadingKey = 1,

    /// Key installed; the worker must handshake before the next APDU
    KeyLoaded = 2,

    /// The worker is running the handshake
    Handshake = 3,

    /// Channel established
    Enabled = 4,
}

impl ShieldState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ShieldState::LoadingKey,
            2 => ShieldState::KeyLoaded,
            3 => ShieldState::Handshake,
            4 => ShieldState::Enabled,
            _ => ShieldState::Disabled,
        }
    }
}

/// Plain-channel exchange lent to the collaborator for handshake traffic
pub trait RawExchange {
    /// Send `tx` and read the response into `rx`, returning its length
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> trustlink_transport::Result<usize>;
}

/// External shielded-channel collaborator.
///
/// Implementations own the key material, the handshake cryptography and the
/// session secrets; the driver only sequences the calls.
pub trait ShieldSession: Send {
    /// Install the pre-shared secret. Fails only on an invalid key.
    fn set_shared_secret(&mut self, key: &[u8]) -> Result<()>;

    /// Run the key-exchange handshake over the plain channel
    fn handshake(&mut self, exchange: &mut dyn RawExchange) -> Result<()>;

    /// Snapshot the session secrets before the chip powers down
    fn save_context(&mut self) -> Result<()>;

    /// Re-install the snapshotted secrets after wake
    fn restore_context(&mut self) -> Result<()>;

    /// Whether the device signalled that the channel must be re-keyed
    fn needs_rehandshake(&self) -> bool;
}

/// Lock-free state machine gating the handshake
#[derive(Debug)]
pub struct ShieldGate {
    state: AtomicU8,
}

impl Default for ShieldGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ShieldGate {
    /// Create the gate in the `Disabled` state
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShieldState::Disabled as u8),
        }
    }

    /// Current state
    pub fn state(&self) -> ShieldState {
        ShieldState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: ShieldState, to: ShieldState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, to: ShieldState) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// Claim the exclusive right to install a key.
    ///
    /// Only one caller can hold it, and only while the channel is down
    /// (`Disabled`) or waiting for a handshake (`KeyLoaded`). Returns the
    /// prior state so a failed install can revert to it.
    pub fn begin_key_load(&self) -> Result<ShieldState> {
        if self.cas(ShieldState::Disabled, ShieldState::LoadingKey) {
            return Ok(ShieldState::Disabled);
        }
        if self.cas(ShieldState::KeyLoaded, ShieldState::LoadingKey) {
            return Ok(ShieldState::KeyLoaded);
        }
        Err(Error::AlreadyInProgress)
    }

    /// Finish a key load: `KeyLoaded` on success, back to `prior` on failure
    pub fn end_key_load(&self, prior: ShieldState, ok: bool) {
        debug_assert_eq!(self.state(), ShieldState::LoadingKey);
        self.set(if ok { ShieldState::KeyLoaded } else { prior });
    }

    /// Worker pre-check: claim a pending handshake, if one is due
    pub fn take_handshake(&self) -> bool {
        self.cas(ShieldState::KeyLoaded, ShieldState::Handshake)
    }

    /// Resolve a claimed handshake
    pub fn finish_handshake(&self, ok: bool) {
        debug_assert_eq!(self.state(), ShieldState::Handshake);
        self.set(if ok {
            ShieldState::Enabled
        } else {
            ShieldState::KeyLoaded
        });
    }

    /// Drop an established channel back to `KeyLoaded` (rehandshake request,
    /// reset recovery, failed context save). No-op unless `Enabled`; returns
    /// whether the demotion happened.
    pub fn demote(&self) -> bool {
        self.cas(ShieldState::Enabled, ShieldState::KeyLoaded)
    }
}
