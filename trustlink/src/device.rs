//! Device Context and Management Commands
//!
//! Owns the protocol stack for one chip (bus, data link, nettran) plus the
//! management exchanges the orchestrator needs: application open/close,
//! hibernate context handling, the diagnostic error-code read, and power
//! switching. Everything here runs on the worker thread; the only
//! cross-thread state are the shared registries passed in at construction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use trustlink_transport::{DataLink, FrameBus, Nettran};

use crate::error::{Error, Result};
use crate::session::SessionRegistry;
#[cfg(feature = "shield")]
use crate::shield::{RawExchange, ShieldGate, ShieldSession, ShieldState};

#[cfg(feature = "shield")]
use std::sync::Mutex;

/// Shared handle to the shield collaborator; the gate serializes access
/// logically, the mutex satisfies the type system
#[cfg(feature = "shield")]
pub(crate) type SharedShield = Arc<Mutex<Box<dyn ShieldSession>>>;

/// Offset of the status byte in a response APDU
pub(crate) const APDU_STA_OFFSET: usize = 0;

/// Status byte value meaning success
pub(crate) const APDU_STA_SUCCESS: u8 = 0x00;

const APDU_PARAM_OFFSET: usize = 1;
const APDU_LEN_OFFSET: usize = 2;
const APDU_DATA_OFFSET: usize = 4;

/// Length of the hibernate context handle the chip hands out
pub(crate) const CTX_HANDLE_LEN: usize = 8;

/// Unique application identifier expected by the chip
const APP_ID: [u8; 16] = [
    0xD2, 0x76, 0x00, 0x00, 0x04, 0x47, 0x65, 0x6E, 0x41, 0x75, 0x74, 0x68, 0x41, 0x70, 0x70,
    0x6C,
];

/// OpenApplication with a clean context
const OPEN_APPLICATION_APDU: [u8; 20] = [
    0xF0, // command code
    0x00, // param
    0x00, 0x10, // 16 bytes of application id follow
    0xD2, 0x76, 0x00, 0x00, 0x04, 0x47, 0x65, 0x6E, 0x41, 0x75, 0x74, 0x68, 0x41, 0x70, 0x70,
    0x6C,
];

/// CloseApplication without saving context
const CLOSE_APPLICATION_APDU: [u8; 4] = [
    0xF1, // command code
    0x00, // param
    0x00, 0x00, // no in-data
];

/// Param value selecting the hibernate/restore variants
const APDU_PARAM_CONTEXT: u8 = 0x01;

/// GetDataObject on the error-code object, reading 1 byte without clearing
/// it, so the pending code can be fetched after a failed command
const ERROR_CODE_APDU: [u8; 10] = [
    0x01, // GetDataObject, keep the error code
    0x00, // read data
    0x00, 0x06, // 6 bytes following
    0xF1, 0xC2, // error-codes object
    0x00, 0x00, // offset
    0x00, 0x01, // all error codes are 1 byte
];

const GET_ERROR_RESPONSE_LEN: usize = 5;
const OPEN_APPLICATION_RESPONSE_LEN: usize = 4;

/// Chip startup time after power-on, from the datasheet
const STARTUP_TIME: Duration = Duration::from_millis(15);

/// Default bound on consecutive recovery attempts
pub const DEFAULT_MAX_RESET: u32 = 3;

/// Default idle time before the worker tries to hibernate
pub const DEFAULT_HIBERNATE_DELAY: Duration = Duration::from_millis(1000);

/// External power switch for the chip, when the board wires one up
pub trait PowerControl: Send {
    /// Drive the supply on or off
    fn set_power(&mut self, on: bool) -> Result<()>;
}

/// Driver configuration handed to [`crate::SecureElement::start`]
pub struct Options {
    /// Power switch; without one the chip stays powered and the worker never
    /// hibernates
    pub power: Option<Box<dyn PowerControl>>,

    /// Consecutive failed recoveries before the driver locks out
    pub max_reset: u32,

    /// Idle time before a hibernate attempt (only with power control)
    pub hibernate_delay: Duration,

    /// Shielded-channel collaborator; `None` leaves the capability off
    #[cfg(feature = "shield")]
    pub shield: Option<Box<dyn ShieldSession>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            power: None,
            max_reset: DEFAULT_MAX_RESET,
            hibernate_delay: DEFAULT_HIBERNATE_DELAY,
            #[cfg(feature = "shield")]
            shield: None,
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_reset == 0 {
            return Err(Error::Config("max_reset must be at least 1".into()));
        }
        if self.hibernate_delay.is_zero() {
            return Err(Error::Config("hibernate_delay must be non-zero".into()));
        }
        Ok(())
    }
}

/// Whether a response APDU carries a device error status
pub(crate) fn apdu_is_error(response: &[u8]) -> bool {
    response[APDU_STA_OFFSET] != APDU_STA_SUCCESS
}

/// Per-chip context, owned and driven by the worker thread
pub(crate) struct Device<B: FrameBus> {
    bus: B,
    link: DataLink,
    net: Nettran,
    power: Option<Box<dyn PowerControl>>,
    pub(crate) sessions: Arc<SessionRegistry>,
    #[cfg(feature = "shield")]
    pub(crate) gate: Arc<ShieldGate>,
    #[cfg(feature = "shield")]
    pub(crate) shield: Option<SharedShield>,
    pub(crate) reset_counter: u32,
    pub(crate) max_reset: u32,
    pub(crate) hibernate_delay: Duration,
    pub(crate) open: bool,
    hibernate_handle: [u8; CTX_HANDLE_LEN],
}

impl<B: FrameBus> Device<B> {
    /// Build the context. The shield gate and collaborator start empty; the
    /// caller wires them up before the worker takes over.
    pub(crate) fn new(
        bus: B,
        power: Option<Box<dyn PowerControl>>,
        max_reset: u32,
        hibernate_delay: Duration,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let link = DataLink::new(bus.max_frame_len());
        Self {
            bus,
            link,
            net: Nettran::new(),
            power,
            sessions,
            #[cfg(feature = "shield")]
            gate: Arc::new(ShieldGate::new()),
            #[cfg(feature = "shield")]
            shield: None,
            reset_counter: 0,
            max_reset,
            hibernate_delay,
            open: false,
            hibernate_handle: [0u8; CTX_HANDLE_LEN],
        }
    }

    /// Whether hibernate is possible at all
    pub(crate) fn has_power_control(&self) -> bool {
        self.power.is_some()
    }

    /// Switch the supply; powering on waits out the chip's startup time.
    /// Without a power switch this is a no-op.
    pub(crate) fn power(&mut self, on: bool) -> Result<()> {
        if let Some(power) = self.power.as_mut() {
            power.set_power(on)?;
            if on {
                std::thread::sleep(STARTUP_TIME);
            }
        }
        Ok(())
    }

    /// Power-up path for first initialization: drive the supply when one is
    /// wired up, otherwise just wait out the chip's startup time.
    pub(crate) fn startup(&mut self) -> Result<()> {
        if self.power.is_some() {
            self.power(true)
        } else {
            std::thread::sleep(STARTUP_TIME);
            Ok(())
        }
    }

    /// Bring the whole protocol stack to a known state.
    ///
    /// Every layer's init hook is idempotent; this runs at startup and again
    /// on every recovery attempt.
    pub(crate) fn reset_stack(&mut self) -> Result<()> {
        self.bus.reset().map_err(|e| {
            error!("failed to initialize phy layer");
            e
        })?;
        self.link.reset();
        self.net.reset();
        debug!("protocol stack synchronized");
        Ok(())
    }

    /// Send one APDU through the stack
    pub(crate) fn send_apdu(&mut self, apdu: &[u8]) -> trustlink_transport::Result<()> {
        self.net.send(&mut self.link, &mut self.bus, apdu)
    }

    /// Receive one APDU into `out`, returning its length
    pub(crate) fn recv_apdu(&mut self, out: &mut [u8]) -> trustlink_transport::Result<usize> {
        self.net.recv(&mut self.link, &mut self.bus, out)
    }

    /// One full exchange: send, then receive the matching response
    pub(crate) fn transfer(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
    ) -> trustlink_transport::Result<usize> {
        self.send_apdu(tx)?;
        self.recv_apdu(rx)
    }

    /// Fetch the 1-byte error code the chip parked after a failed command
    pub(crate) fn get_error_code(&mut self) -> Result<u8> {
        self.send_apdu(&ERROR_CODE_APDU)?;

        let mut buf = [0u8; GET_ERROR_RESPONSE_LEN];
        let n = self.recv_apdu(&mut buf)?;

        if n != GET_ERROR_RESPONSE_LEN {
            error!(len = n, "unexpected error-code response length");
            return Err(Error::UnexpectedResponse);
        }
        if apdu_is_error(&buf) {
            error!("failed to retrieve error code");
            return Err(Error::UnexpectedResponse);
        }
        if u16::from_be_bytes([buf[APDU_LEN_OFFSET], buf[APDU_LEN_OFFSET + 1]]) != 1 {
            error!("unexpected error-code data length");
            return Err(Error::UnexpectedResponse);
        }

        Ok(buf[APDU_DATA_OFFSET])
    }

    /// Open the application on the chip, optionally restoring the hibernate
    /// context saved by the last [`Self::close_application`]
    pub(crate) fn open_application(&mut self, restore: bool) -> Result<()> {
        // On every error path the application counts as closed
        self.open = false;

        let mut apdu = Vec::with_capacity(OPEN_APPLICATION_APDU.len() + CTX_HANDLE_LEN);
        apdu.extend_from_slice(&OPEN_APPLICATION_APDU);
        if restore {
            debug!(handle = ?self.hibernate_handle, "restoring application context");
            apdu[APDU_PARAM_OFFSET] = APDU_PARAM_CONTEXT;
            let len = (APP_ID.len() + CTX_HANDLE_LEN) as u16;
            apdu[APDU_LEN_OFFSET..APDU_LEN_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
            apdu.extend_from_slice(&self.hibernate_handle);
        }

        self.send_apdu(&apdu)?;

        let mut buf = [0u8; APDU_DATA_OFFSET + CTX_HANDLE_LEN];
        let n = self.recv_apdu(&mut buf)?;

        // The expected response is four zero bytes, nothing else
        if n != OPEN_APPLICATION_RESPONSE_LEN || buf[..n] != [0u8; OPEN_APPLICATION_RESPONSE_LEN] {
            error!(response = ?&buf[..n], "unexpected OpenApplication response");
            return Err(Error::UnexpectedResponse);
        }

        self.open = true;
        Ok(())
    }

    /// Close the application; with `save` the chip hands back a context
    /// handle for the restore on wake
    pub(crate) fn close_application(&mut self, save: bool) -> Result<()> {
        let mut apdu = CLOSE_APPLICATION_APDU;
        if save {
            apdu[APDU_PARAM_OFFSET] = APDU_PARAM_CONTEXT;
        }

        self.send_apdu(&apdu)?;

        let mut buf = [0u8; APDU_DATA_OFFSET + CTX_HANDLE_LEN];
        let n = self.recv_apdu(&mut buf)?;

        if save {
            if n == APDU_DATA_OFFSET && apdu_is_error(&buf) {
                info!("device not ready for hibernate");
                return Err(Error::UnexpectedResponse);
            }
            if n != APDU_DATA_OFFSET + CTX_HANDLE_LEN {
                error!(response = ?&buf[..n], "unexpected CloseApplication response");
                return Err(Error::UnexpectedResponse);
            }
            self.hibernate_handle
                .copy_from_slice(&buf[APDU_DATA_OFFSET..]);
            debug!(handle = ?self.hibernate_handle, "saved application context");
        } else if n != OPEN_APPLICATION_RESPONSE_LEN || apdu_is_error(&buf) {
            error!(response = ?&buf[..n], "unexpected CloseApplication response");
            return Err(Error::UnexpectedResponse);
        }

        self.open = false;
        Ok(())
    }

    /// Try to put the chip into hibernate. Leaves the application open when
    /// a reservation blocks power-down or the chip is not ready.
    pub(crate) fn hibernate(&mut self) {
        // Contexts in the exempt slots are carried through the saved handle;
        // only the remaining reservations hold the chip awake.
        if self.sessions.blocks_hibernate() {
            info!("wake-lock prevents hibernate");
            return;
        }

        let save = self.sessions.needs_context_save();
        if self.close_application(save).is_err() {
            info!("device not ready for hibernate");
            return;
        }

        #[cfg(feature = "shield")]
        if self.gate.state() == ShieldState::Enabled {
            let saved = self
                .with_shield(|shield, _| shield.save_context())
                .unwrap_or(Err(Error::NotSupported));
            if saved.is_err() {
                warn!("couldn't save shield state, re-handshake needed");
                self.gate.demote();
            }
        }

        if let Err(e) = self.power(false) {
            warn!(error = %e, "power-down failed");
        }
    }

    /// Wake the chip from hibernate and bring the stack back up
    pub(crate) fn wakeup(&mut self) -> Result<()> {
        self.power(true)?;
        self.reset_stack()?;

        #[cfg(feature = "shield")]
        if self.gate.state() == ShieldState::Enabled {
            // The collaborator keeps its keys across hibernate; only the
            // session context needs restoring.
            self.net.enable_presence();
            let restored = self
                .with_shield(|shield, _| shield.restore_context())
                .unwrap_or(Err(Error::NotSupported));
            if restored.is_err() {
                warn!("couldn't restore shield state, re-handshake needed");
                self.gate.demote();
            } else {
                info!("shield restored");
            }
        }

        let restore = self.sessions.needs_context_save();
        self.open_application(restore)
    }

    /// Whether the device asked for the shielded channel to be re-keyed
    #[cfg(feature = "shield")]
    pub(crate) fn rehandshake_requested(&mut self) -> bool {
        if !self.net.presence_enabled() {
            return false;
        }
        self.with_shield(|shield, _| shield.needs_rehandshake())
            .unwrap_or(false)
    }

    /// Run the collaborator handshake over the plain channel
    #[cfg(feature = "shield")]
    pub(crate) fn run_handshake(&mut self) -> Result<()> {
        self.with_shield(|shield, dev| shield.handshake(dev))
            .unwrap_or(Err(Error::NotSupported))
    }

    /// Mark the shielded channel active on the wire
    #[cfg(feature = "shield")]
    pub(crate) fn enable_presence(&mut self) {
        self.net.enable_presence();
    }

    /// Borrow the collaborator together with the device it may talk through
    #[cfg(feature = "shield")]
    fn with_shield<R>(
        &mut self,
        f: impl FnOnce(&mut dyn ShieldSession, &mut Self) -> R,
    ) -> Option<R> {
        let shield = Arc::clone(self.shield.as_ref()?);
        let mut guard = shield.lock().unwrap();
        Some(f(&mut **guard, self))
    }
}

#[cfg(feature = "shield")]
impl<B: FrameBus> RawExchange for Device<B> {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> trustlink_transport::Result<usize> {
        Device::transfer(self, tx, rx)
    }
}
