//! Orchestrator Worker
//!
//! One dedicated thread drives this state machine for the lifetime of the
//! device. It serializes all bus traffic, masks transient faults from
//! callers by resetting and re-initializing the stack (up to a configured
//! bound), and powers the chip down when it has been idle long enough.
//!
//! ```text
//! Idle ──queue item──> ProcessApdu ──transport fault──> Reset
//!  │  └─idle timeout─> Hibernate ──wake failure───────> Reset
//!  │                       │                              │ bound reached
//!  └───────<──────────────┘                              v
//!                                                    ResetLock (absorbing)
//! ```
//!
//! Every APDU that enters the queue resolves exactly once, whatever path it
//! takes through here.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};

use tracing::{debug, error, info};
use trustlink_transport::FrameBus;

use crate::device::{apdu_is_error, Device};
use crate::error::{ApduOutcome, Error};
use crate::request::Apdu;

/// Worker states; `ResetLock` is absorbing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Idle,
    Hibernate,
    ProcessApdu,
    Reset,
    ResetLock,
}

/// Whether the loop keeps running after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Worker<B: FrameBus> {
    dev: Device<B>,
    queue: Receiver<Apdu>,
    pub(crate) state: WorkerState,
    pending: Option<Apdu>,
}

impl<B: FrameBus> Worker<B> {
    pub(crate) fn new(dev: Device<B>, queue: Receiver<Apdu>) -> Self {
        Self {
            dev,
            queue,
            state: WorkerState::Idle,
            pending: None,
        }
    }

    /// Run until every queue handle is gone (process teardown)
    pub(crate) fn run(mut self) {
        while self.step() == Flow::Continue {}
        debug!("worker exiting");
    }

    /// Execute one state transition.
    ///
    /// Separated from [`Self::run`] so tests can drive the machine
    /// deterministically against a scripted bus.
    pub(crate) fn step(&mut self) -> Flow {
        match self.state {
            WorkerState::Idle => self.step_idle(),
            WorkerState::Hibernate => self.step_hibernate(),
            WorkerState::ProcessApdu => self.step_process(),
            WorkerState::Reset => self.step_reset(),
            WorkerState::ResetLock => self.step_reset_lock(),
        }
    }

    fn step_idle(&mut self) -> Flow {
        // Only a power-controllable chip is worth hibernating; otherwise
        // wait for work indefinitely.
        let apdu = if self.dev.has_power_control() {
            match self.queue.recv_timeout(self.dev.hibernate_delay) {
                Ok(apdu) => Some(apdu),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Flow::Exit,
            }
        } else {
            match self.queue.recv() {
                Ok(apdu) => Some(apdu),
                Err(_) => return Flow::Exit,
            }
        };

        match apdu {
            Some(apdu) => {
                self.pending = Some(apdu);
                self.state = WorkerState::ProcessApdu;
            }
            None => self.state = WorkerState::Hibernate,
        }
        Flow::Continue
    }

    fn step_hibernate(&mut self) -> Flow {
        self.dev.hibernate();

        if self.dev.open {
            // Couldn't hibernate, try again after the next idle period
            self.state = WorkerState::Idle;
            return Flow::Continue;
        }

        // Powered down; sleep until there is work again
        let apdu = match self.queue.recv() {
            Ok(apdu) => apdu,
            Err(_) => return Flow::Exit,
        };

        match self.dev.wakeup() {
            Ok(()) => {
                // Successful wake; any earlier trouble is resolved
                self.dev.reset_counter = 0;
                self.pending = Some(apdu);
                self.state = WorkerState::ProcessApdu;
            }
            Err(e) => {
                error!(error = %e, "failed to wake device");
                apdu.complete(Err(e));
                self.state = WorkerState::Reset;
            }
        }
        Flow::Continue
    }

    fn step_process(&mut self) -> Flow {
        let Some(mut apdu) = self.pending.take() else {
            self.state = WorkerState::Idle;
            return Flow::Continue;
        };

        #[cfg(feature = "shield")]
        if self.dev.gate.take_handshake() {
            match self.dev.run_handshake() {
                Ok(()) => {
                    info!("shielded connection enabled");
                    self.dev.gate.finish_handshake(true);
                    self.dev.enable_presence();
                }
                Err(e) => {
                    error!(error = %e, "handshake failed");
                    self.dev.gate.finish_handshake(false);
                    apdu.complete(Err(Error::HandshakeFailed));

                    // Queued APDUs may rely on the encrypted channel; clear
                    // them out through a reset.
                    self.state = WorkerState::Reset;
                    return Flow::Continue;
                }
            }
        }

        let n = match self.dev.transfer(&apdu.tx, &mut apdu.rx) {
            Ok(n) => {
                // Successful transfer; any earlier trouble is resolved
                self.dev.reset_counter = 0;
                n
            }
            Err(e) => {
                error!(error = %e, "APDU transfer failed");
                apdu.complete(Err(e.into()));
                self.state = WorkerState::Reset;
                return Flow::Continue;
            }
        };

        #[cfg(feature = "shield")]
        if self.dev.rehandshake_requested() && self.dev.gate.demote() {
            info!("executing re-handshake");
        }

        if n == 0 {
            error!("empty response APDU");
            apdu.complete(Err(Error::UnexpectedResponse));
            self.state = WorkerState::Reset;
            return Flow::Continue;
        }

        if apdu_is_error(&apdu.rx[..n]) {
            // The chip parked a 1-byte error code; fetch it and hand it to
            // the caller as the command's outcome, not as a driver fault.
            match self.dev.get_error_code() {
                Ok(code) => {
                    #[cfg(feature = "shield")]
                    if self.dev.rehandshake_requested() && self.dev.gate.demote() {
                        info!("executing re-handshake");
                    }

                    apdu.complete(Ok(ApduOutcome::DeviceError(code)));
                    self.state = WorkerState::Idle;
                }
                Err(e) => {
                    error!(error = %e, "failed to retrieve error code");
                    apdu.complete(Err(e));
                    self.state = WorkerState::Reset;
                }
            }
            return Flow::Continue;
        }

        let mut data = std::mem::take(&mut apdu.rx);
        data.truncate(n);
        apdu.complete(Ok(ApduOutcome::Ok(data)));
        self.state = WorkerState::Idle;
        Flow::Continue
    }

    fn step_reset(&mut self) -> Flow {
        debug_assert!(self.pending.is_none(), "APDU must be resolved before reset");

        self.dev.reset_counter += 1;

        if self.dev.reset_counter >= self.dev.max_reset {
            error!("maximum reset count reached, turning off");
            if let Err(e) = self.dev.power(false) {
                error!(error = %e, "final power-down failed");
            }
            self.state = WorkerState::ResetLock;
            return Flow::Continue;
        }

        error!(attempt = self.dev.reset_counter, "resetting device");

        if self.dev.reset_stack().is_err() {
            // If even the reset fails, something is seriously wrong; the
            // counter keeps climbing towards the lock-out.
            error!("failed to reset protocol stack");
            return Flow::Continue;
        }
        if self.dev.open_application(false).is_err() {
            error!("failed to reopen application");
            return Flow::Continue;
        }

        // Anything still queued may depend on a session context the reset
        // just destroyed; fail it all rather than run it against the wrong
        // state.
        loop {
            match self.queue.try_recv() {
                Ok(apdu) => apdu.complete(Err(Error::DeviceReset)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        #[cfg(feature = "shield")]
        if self.dev.gate.demote() {
            info!("shielded connection needs a new handshake after reset");
        }

        self.state = WorkerState::Idle;
        Flow::Continue
    }

    fn step_reset_lock(&mut self) -> Flow {
        // Permanent dead end until the driver is re-initialized: answer
        // every request without touching the bus.
        match self.queue.recv() {
            Ok(apdu) => {
                apdu.complete(Err(Error::ExhaustedRetries));
                Flow::Continue
            }
            Err(_) => Flow::Exit,
        }
    }
}
