//! Shared test fixtures: a frame-level simulated secure element.
//!
//! `SimBus` implements the driver's `FrameBus` seam and behaves like the
//! chip's data-link endpoint: it acknowledges data frames (including the
//! spontaneous control-acknowledge quirk), answers the management commands
//! (OpenApplication, CloseApplication, the error-code read) itself, and
//! hands every other APDU to a configurable handler.
//!
//! All observable state lives in an `Arc<SimState>` so tests can inspect and
//! steer the device after the bus has moved into the worker thread.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trustlink::transport::frame::{self, FrameKind, SeqCtl};
use trustlink::transport::{BusStatus, Error, FrameBus, Result, STATUS_RESPONSE_READY};
use trustlink::PowerControl;

/// Negotiated frame length of the simulated chip
pub const SIM_FRAME_LEN: usize = 0x110;

/// Coprocessor UID data object read, the canonical smoke-test command
pub const UID_APDU: [u8; 6] = [0x81, 0x00, 0x00, 0x02, 0xE0, 0xC2];

/// Non-unique identifier bytes the simulated chip reports
pub const UID_BYTES: [u8; 27] = [
    0xCD, 0x16, 0x33, 0x82, 0x01, 0x00, 0x1C, 0x00, 0x05, 0x00, 0x00, 0x0A, 0x0B, 0x0C, 0x0D,
    0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19,
];

/// Shared, thread-safe view of the simulated device
#[derive(Debug, Default)]
pub struct SimState {
    /// Every bus call (reset/write/read/status)
    pub ops: AtomicUsize,

    /// Fail every bus call while set
    pub fail: AtomicBool,

    /// Fail exactly this many upcoming bus calls, then recover
    pub fail_n: AtomicUsize,

    /// Park all bus calls in a busy-wait while set (test sequencing aid)
    pub hold: AtomicBool,

    /// Application (non-management) APDUs answered
    pub transfers: AtomicUsize,

    /// OpenApplication commands seen
    pub opens: AtomicUsize,

    /// OpenApplication commands with context restore
    pub restores: AtomicUsize,

    /// Plain CloseApplication commands
    pub closes: AtomicUsize,

    /// CloseApplication commands with context save
    pub hibernate_closes: AtomicUsize,

    /// Refuse hibernate (answer CloseApplication(save) with an error) while
    /// clear
    pub hibernate_ready: AtomicBool,

    /// A restore carried a handle that does not match the saved one
    pub handle_mismatch: AtomicBool,

    /// Error code parked in the diagnostic object
    pub error_code: AtomicU8,

    /// Supply state as driven through `SimPower`
    pub powered: AtomicBool,

    /// Power-on transitions
    pub power_ups: AtomicUsize,
}

impl SimState {
    pub fn new() -> Arc<Self> {
        let state = Self::default();
        state.hibernate_ready.store(true, Ordering::SeqCst);
        Arc::new(state)
    }
}

/// Handler for application APDUs: request bytes in, response APDU out
pub type ApduHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Frame-level simulated secure element
pub struct SimBus {
    state: Arc<SimState>,
    handler: ApduHandler,

    // Device-side data-link counters
    dev_rx_seq: u8,
    dev_tx_seq: u8,

    pending_ctrl: Option<Vec<u8>>,
    pending_data: VecDeque<Vec<u8>>,

    saved_handle: Option<[u8; 8]>,
    handle_counter: u8,
}

impl SimBus {
    /// Device answering every application APDU with a bare success header
    pub fn new(state: Arc<SimState>) -> Self {
        Self::with_handler(state, Box::new(|_| vec![0x00, 0x00, 0x00, 0x00]))
    }

    /// Device with a custom application-APDU handler
    pub fn with_handler(state: Arc<SimState>, handler: ApduHandler) -> Self {
        Self {
            state,
            handler,
            dev_rx_seq: 0,
            dev_tx_seq: 0,
            pending_ctrl: None,
            pending_data: VecDeque::new(),
            saved_handle: None,
            handle_counter: 0,
        }
    }

    /// Device that knows the UID data object and reports `error_code` for
    /// everything else
    pub fn with_uid_device(state: Arc<SimState>) -> Self {
        Self::with_handler(
            state,
            Box::new(|apdu| {
                if apdu == UID_APDU {
                    // Success header with the 27 identifier bytes
                    let mut resp = vec![0x00, 0x00, 0x00, 0x1B];
                    resp.extend_from_slice(&UID_BYTES);
                    resp
                } else {
                    // Structurally invalid command: error status, the real
                    // code is parked in the diagnostic object
                    vec![0xFF, 0x00, 0x00, 0x00]
                }
            }),
        )
    }

    fn pre_op(&mut self) -> Result<()> {
        while self.state.hold.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        self.state.ops.fetch_add(1, Ordering::SeqCst);

        if self.state.fail.load(Ordering::SeqCst) {
            return Err(Error::Bus("sim: injected failure".into()));
        }
        if self.state.fail_n.load(Ordering::SeqCst) > 0 {
            self.state.fail_n.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Bus("sim: injected failure".into()));
        }
        Ok(())
    }

    fn next_handle(&mut self) -> [u8; 8] {
        self.handle_counter = self.handle_counter.wrapping_add(1);
        let mut handle = [0u8; 8];
        for (i, b) in handle.iter_mut().enumerate() {
            *b = self.handle_counter.wrapping_add(i as u8) ^ 0x5A;
        }
        handle
    }

    /// The chip-side command interpreter
    fn respond(&mut self, apdu: &[u8]) -> Vec<u8> {
        match apdu[0] {
            // OpenApplication
            0xF0 => {
                self.state.opens.fetch_add(1, Ordering::SeqCst);
                if apdu[1] == 0x01 {
                    self.state.restores.fetch_add(1, Ordering::SeqCst);
                    let handle = &apdu[20..28];
                    if self.saved_handle.map(|h| h.as_slice() != handle).unwrap_or(true) {
                        self.state.handle_mismatch.store(true, Ordering::SeqCst);
                    }
                }
                vec![0x00, 0x00, 0x00, 0x00]
            }
            // CloseApplication
            0xF1 => {
                if !self.state.hibernate_ready.load(Ordering::SeqCst) {
                    return vec![0xFF, 0x00, 0x00, 0x00];
                }
                if apdu[1] == 0x01 {
                    self.state.hibernate_closes.fetch_add(1, Ordering::SeqCst);
                    let handle = self.next_handle();
                    self.saved_handle = Some(handle);
                    let mut resp = vec![0x00, 0x00, 0x00, 0x08];
                    resp.extend_from_slice(&handle);
                    resp
                } else {
                    self.state.closes.fetch_add(1, Ordering::SeqCst);
                    vec![0x00, 0x00, 0x00, 0x00]
                }
            }
            // GetDataObject on the error-code object
            0x01 if apdu.len() == 10 && apdu[4..6] == [0xF1, 0xC2] => {
                vec![0x00, 0x00, 0x00, 0x01, self.state.error_code.load(Ordering::SeqCst)]
            }
            _ => {
                self.state.transfers.fetch_add(1, Ordering::SeqCst);
                (self.handler)(apdu)
            }
        }
    }
}

impl FrameBus for SimBus {
    fn reset(&mut self) -> Result<()> {
        self.pre_op()?;
        self.dev_rx_seq = 0;
        self.dev_tx_seq = 0;
        self.pending_ctrl = None;
        self.pending_data.clear();
        Ok(())
    }

    fn write_frame(&mut self, raw: &[u8]) -> Result<()> {
        self.pre_op()?;

        let f = frame::decode(raw).map_err(|_| Error::Bus("sim: malformed frame".into()))?;
        match f.kind {
            // Host acknowledging our data frame; nothing to do
            FrameKind::Control => Ok(()),
            FrameKind::Data => {
                assert_eq!(f.seqctl, SeqCtl::Ack);
                self.dev_rx_seq = f.seq;

                // The spontaneous-acknowledge quirk: the control frame is
                // already waiting by the time the host polls the status.
                self.pending_ctrl = Some(frame::encode(
                    FrameKind::Control,
                    SeqCtl::Ack,
                    0,
                    self.dev_rx_seq,
                    &[],
                ));

                // Tests run single-segment messages only
                assert_eq!(f.payload[0] & 0x07, 0, "sim: chained message");
                let response = self.respond(&f.payload[1..].to_vec());

                let mut payload = vec![0u8];
                payload.extend_from_slice(&response);
                let data = frame::encode(
                    FrameKind::Data,
                    SeqCtl::Ack,
                    self.dev_tx_seq,
                    self.dev_rx_seq,
                    &payload,
                );
                self.dev_tx_seq = (self.dev_tx_seq + 1) % 4;
                self.pending_data.push_back(data);
                Ok(())
            }
        }
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.pre_op()?;

        let frame = self
            .pending_ctrl
            .take()
            .or_else(|| self.pending_data.pop_front())
            .ok_or_else(|| Error::Bus("sim: nothing to read".into()))?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn status(&mut self) -> Result<BusStatus> {
        self.pre_op()?;

        let read_len = self
            .pending_ctrl
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.pending_data.front().map(Vec::len))
            .unwrap_or(0);

        Ok(BusStatus {
            read_len: read_len as u16,
            flags: if read_len > 0 { STATUS_RESPONSE_READY } else { 0 },
        })
    }

    fn max_frame_len(&self) -> usize {
        SIM_FRAME_LEN
    }
}

/// Power switch wired to the shared state
pub struct SimPower {
    state: Arc<SimState>,
}

impl SimPower {
    pub fn new(state: Arc<SimState>) -> Self {
        state.powered.store(true, Ordering::SeqCst);
        Self { state }
    }
}

impl PowerControl for SimPower {
    fn set_power(&mut self, on: bool) -> trustlink::Result<()> {
        self.state.powered.store(on, Ordering::SeqCst);
        if on {
            self.state.power_ups.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Wait until `predicate` holds, or panic after a few seconds
pub fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
