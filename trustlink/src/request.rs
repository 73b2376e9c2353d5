//! APDU Requests and One-Shot Completion
//!
//! Callers build an [`Apdu`], hand it to the driver (transferring ownership)
//! and wait on the matching [`ApduHandle`]. The completion cell is written
//! exactly once: [`Apdu::complete`] consumes the request, so the worker
//! cannot sign it off twice and a completed request cannot re-enter the
//! queue.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::ApduResult;

/// Shared half of the completion cell
#[derive(Debug, Default)]
struct Cell {
    slot: Mutex<Option<ApduResult>>,
    cond: Condvar,
}

/// One command/response exchange with the secure element.
///
/// Owns the command bytes and a response buffer of the capacity the caller
/// chose; the payload is opaque to the driver.
#[derive(Debug)]
pub struct Apdu {
    pub(crate) tx: Vec<u8>,
    pub(crate) rx: Vec<u8>,
    cell: Arc<Cell>,
}

/// Caller-side handle resolving to the exchange's final value
#[derive(Debug)]
pub struct ApduHandle {
    cell: Arc<Cell>,
}

impl Apdu {
    /// Create a request from the command bytes, with room for a response of
    /// up to `rx_capacity` bytes
    pub fn new(tx: impl Into<Vec<u8>>, rx_capacity: usize) -> (Self, ApduHandle) {
        let cell = Arc::new(Cell::default());
        (
            Self {
                tx: tx.into(),
                rx: vec![0u8; rx_capacity],
                cell: Arc::clone(&cell),
            },
            ApduHandle { cell },
        )
    }

    /// Command bytes to send
    pub fn tx_bytes(&self) -> &[u8] {
        &self.tx
    }

    /// Resolve the exchange, waking the caller.
    ///
    /// Consumes the request; each APDU is completed exactly once.
    pub(crate) fn complete(self, result: ApduResult) {
        let mut slot = self.cell.slot.lock().unwrap();
        debug_assert!(slot.is_none(), "APDU completed twice");
        *slot = Some(result);
        self.cell.cond.notify_all();
    }
}

impl ApduHandle {
    /// Block until the exchange resolves.
    ///
    /// The cell stays resolved; repeated calls return the same value.
    pub fn wait(&self) -> ApduResult {
        let mut slot = self.cell.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.cell.cond.wait(slot).unwrap();
        }
    }

    /// Return the result if the exchange already resolved
    pub fn try_wait(&self) -> Option<ApduResult> {
        self.cell.slot.lock().unwrap().clone()
    }
}
