//! Session Slot Reservations
//!
//! The chip exposes a small number of cryptographic session contexts.
//! Callers reserve a slot while they depend on its chip-side state so the
//! worker does not tear it down underneath them. Reservations are a plain
//! atomic bitmask: lock-free, usable from any thread, never blocking.
//!
//! The low [`HIBERNATE_EXEMPT_SESSIONS`] slots do not block hibernate;
//! their context travels through the saved hibernate handle instead.

use std::sync::atomic::{AtomicU32, Ordering};

/// Number of reservable session slots
pub const SESSION_SLOTS: usize = 32;

/// Slots below this index never block hibernate; their contexts are saved
/// via the close-application handle and restored on wake
pub const HIBERNATE_EXEMPT_SESSIONS: usize = 8;

const EXEMPT_MASK: u32 = (1 << HIBERNATE_EXEMPT_SESSIONS) - 1;

/// Lock-free registry of exclusively held session slots
#[derive(Debug, Default)]
pub struct SessionRegistry {
    bits: AtomicU32,
}

impl SessionRegistry {
    /// Create the registry with every slot free
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to reserve `slot`. Returns false, without blocking or queueing,
    /// if it is already held or out of range.
    pub fn acquire(&self, slot: usize) -> bool {
        if slot >= SESSION_SLOTS {
            return false;
        }
        let bit = 1u32 << slot;
        self.bits.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Release `slot`. Releasing a slot that is not held is a no-op.
    pub fn release(&self, slot: usize) {
        if slot >= SESSION_SLOTS {
            return;
        }
        self.bits.fetch_and(!(1u32 << slot), Ordering::AcqRel);
    }

    /// Whether any held slot forbids powering the chip down
    pub fn blocks_hibernate(&self) -> bool {
        self.bits.load(Ordering::Acquire) & !EXEMPT_MASK != 0
    }

    /// Whether any held slot needs its context carried across hibernate
    pub fn needs_context_save(&self) -> bool {
        self.bits.load(Ordering::Acquire) & EXEMPT_MASK != 0
    }
}
