//! Public Driver Handle
//!
//! [`SecureElement::start`] brings the chip up on the calling thread, then
//! hands the device context to the dedicated worker. The returned handle is
//! the only way in: callers enqueue APDUs, reserve session slots and load
//! the shield key; everything else happens behind the queue.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use tracing::info;
use trustlink_transport::FrameBus;

use crate::device::{Device, Options};
use crate::error::{Error, Result};
use crate::request::Apdu;
use crate::session::SessionRegistry;
use crate::worker::Worker;

#[cfg(feature = "shield")]
use crate::device::SharedShield;
#[cfg(feature = "shield")]
use crate::shield::ShieldGate;
#[cfg(feature = "shield")]
use std::sync::Mutex;

/// Handle to one running secure-element driver.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and are safe to
/// call from any thread. Dropping the last handle lets the worker thread
/// wind down once its queue drains.
pub struct SecureElement {
    queue: Sender<Apdu>,
    sessions: Arc<SessionRegistry>,
    #[cfg(feature = "shield")]
    gate: Arc<ShieldGate>,
    #[cfg(feature = "shield")]
    shield: Option<SharedShield>,
}

impl std::fmt::Debug for SecureElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureElement").finish_non_exhaustive()
    }
}

impl SecureElement {
    /// Power the chip up, initialize the full protocol stack, open the
    /// application and spawn the worker.
    ///
    /// Any failure here aborts startup: no thread is spawned and the bus is
    /// released with the returned error.
    pub fn start<B>(bus: B, mut options: Options) -> Result<Self>
    where
        B: FrameBus + Send + 'static,
    {
        options.validate()?;

        let sessions = Arc::new(SessionRegistry::new());
        let mut dev = Device::new(
            bus,
            options.power.take(),
            options.max_reset,
            options.hibernate_delay,
            Arc::clone(&sessions),
        );

        #[cfg(feature = "shield")]
        let gate = Arc::clone(&dev.gate);
        #[cfg(feature = "shield")]
        let shield: Option<SharedShield> =
            options.shield.take().map(|s| Arc::new(Mutex::new(s)));
        #[cfg(feature = "shield")]
        {
            dev.shield = shield.clone();
        }

        // Bring the stack to a known state before accepting any work
        dev.startup()?;
        dev.reset_stack()?;
        dev.open_application(false)?;
        info!("secure element initialized");

        let (queue, worker_queue) = mpsc::channel();
        thread::Builder::new()
            .name("secure-element".into())
            .spawn(move || Worker::new(dev, worker_queue).run())
            .map_err(|e| Error::Config(format!("failed to spawn worker thread: {e}")))?;

        Ok(Self {
            queue,
            sessions,
            #[cfg(feature = "shield")]
            gate,
            #[cfg(feature = "shield")]
            shield,
        })
    }

    /// Queue one APDU for execution.
    ///
    /// Returns immediately; the outcome arrives through the request's
    /// [`crate::ApduHandle`], exactly once, whatever happens to the device
    /// in between.
    pub fn enqueue(&self, apdu: Apdu) {
        if let Err(rejected) = self.queue.send(apdu) {
            // The worker is gone; this can only happen while the process is
            // tearing down. Resolve the request instead of dropping it.
            rejected.0.complete(Err(Error::ExhaustedRetries));
        }
    }

    /// Reserve a chip-side session slot. Returns false without blocking if
    /// it is already held.
    pub fn acquire_session(&self, slot: usize) -> bool {
        self.sessions.acquire(slot)
    }

    /// Return a session slot. Releasing an unheld slot is a no-op.
    pub fn release_session(&self, slot: usize) {
        self.sessions.release(slot)
    }

    /// Install the shielded-connection pre-shared key.
    ///
    /// The handshake itself runs on the worker, right before the next APDU.
    /// Fails with [`Error::AlreadyInProgress`] while another key load or an
    /// established channel is in the way, and with [`Error::NotSupported`]
    /// when no shield collaborator was configured.
    #[cfg(feature = "shield")]
    pub fn start_shield(&self, key: &[u8]) -> Result<()> {
        let Some(shield) = &self.shield else {
            return Err(Error::NotSupported);
        };

        let prior = self.gate.begin_key_load()?;
        let res = shield.lock().unwrap().set_shared_secret(key);
        self.gate.end_key_load(prior, res.is_ok());
        res
    }

    /// Shielded connections are not compiled in
    #[cfg(not(feature = "shield"))]
    pub fn start_shield(&self, _key: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }
}
