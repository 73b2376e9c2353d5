//! Data-Link Session
//!
//! Stop-and-wait ARQ over the bus primitive: at most one unacknowledged
//! frame is outstanding at any time, sequence numbers run mod 4.
//!
//! The session owns the single physical frame buffer. Send and receive share
//! it, so acknowledging an incoming data frame saves and restores the header
//! bytes it is about to overwrite.

use tracing::{debug, error, trace, warn};

use crate::bus::FrameBus;
use crate::error::{Error, Result};
use crate::frame::{self, FrameKind, SeqCtl, CTRL_FRAME_LEN, FRAME_OVERHEAD, PAYLOAD_OFFSET};

/// Scalar view of a received frame, detached from the shared buffer
struct RecvMeta {
    kind: FrameKind,
    seq: u8,
    payload_len: usize,
}

/// One data-link session.
///
/// Owned by a single device context and driven by one thread at a time; the
/// worker serializes all bus access above this layer.
#[derive(Debug)]
pub struct DataLink {
    /// Sequence number of the next frame to send
    tx_seq: u8,

    /// Last ack number the device sent us; repeats are harmless duplicates
    tx_last_acked: u8,

    /// Sequence number of the last data frame received, echoed in our acks
    rx_seq: u8,

    /// The shared send/receive frame buffer, sized to the negotiated maximum
    buf: Vec<u8>,
}

impl DataLink {
    /// Create a session for a bus with the given negotiated frame length
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            tx_seq: 0,
            tx_last_acked: 0,
            rx_seq: 0,
            buf: vec![0u8; max_frame_len],
        }
    }

    /// Data-link init hook: return the counters to the synchronized state.
    ///
    /// The device resets its own counters on power-up, so this is called on
    /// startup, wake and every recovery attempt.
    pub fn reset(&mut self) {
        self.tx_seq = 0;
        self.tx_last_acked = 0;
        self.rx_seq = 0;
        trace!("data link synchronized");
    }

    /// Current transmit sequence number (next frame to send)
    pub fn tx_seq(&self) -> u8 {
        self.tx_seq
    }

    /// Send one payload as a data frame.
    ///
    /// After the write, the device may already have produced a spontaneous
    /// zero-payload control acknowledge; if the status word shows exactly one
    /// control frame pending it is received, validated and discarded.
    /// Absence is not an error.
    pub fn send(&mut self, bus: &mut dyn FrameBus, payload: &[u8]) -> Result<()> {
        if payload.len() + FRAME_OVERHEAD > bus.max_frame_len() {
            error!(len = payload.len(), "payload exceeds negotiated frame size");
            return Err(Error::FrameTooLarge);
        }

        let total = frame::encode_into(
            &mut self.buf,
            FrameKind::Data,
            SeqCtl::Ack,
            self.tx_seq,
            self.rx_seq,
            payload,
        );
        bus.write_frame(&self.buf[..total])?;
        trace!(seq = self.tx_seq, len = payload.len(), "data frame sent");

        let status = bus.status()?;
        if status.read_len as usize == CTRL_FRAME_LEN {
            debug!("control frame pending after send, draining");
            return self.recv_ctrl(bus);
        }

        Ok(())
    }

    /// Receive one data frame and acknowledge it.
    ///
    /// Returns the payload, borrowed from the session buffer; it stays valid
    /// until the next send or receive.
    pub fn recv(&mut self, bus: &mut dyn FrameBus) -> Result<&[u8]> {
        let meta = self.recv_common(bus)?;

        if meta.kind == FrameKind::Control {
            error!("unexpected control frame");
            return Err(Error::UnexpectedFrameType);
        }

        // Acknowledge this frame
        self.rx_seq = meta.seq;
        self.send_ack(bus)?;

        Ok(&self.buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + meta.payload_len])
    }

    /// Read and validate one frame, running the acknowledge bookkeeping.
    fn recv_common(&mut self, bus: &mut dyn FrameBus) -> Result<RecvMeta> {
        let n = bus.read_frame(&mut self.buf)?;
        trace!(len = n, "frame received");

        let decoded = frame::decode(&self.buf[..n])?;
        if decoded.seqctl != SeqCtl::Ack {
            // NAK/RESET from the device are unrecoverable at this layer;
            // no retransmission is implemented.
            error!(seqctl = ?decoded.seqctl, "frame not acknowledged");
            return Err(Error::UnexpectedFrameType);
        }

        let meta = RecvMeta {
            kind: decoded.kind,
            seq: decoded.seq,
            payload_len: decoded.payload.len(),
        };
        let ack = decoded.ack;

        if ack == self.tx_seq {
            // Outstanding frame acknowledged, advance for the next send
            self.tx_seq = (self.tx_seq + 1) % 4;
            self.tx_last_acked = ack;
        } else if ack == self.tx_last_acked {
            debug!(ack, "received same ack twice");
        } else {
            error!(ack, expected = self.tx_seq, "wrong frame acknowledged");
            return Err(Error::UnexpectedAck);
        }

        Ok(meta)
    }

    /// Receive a frame that must be a zero-payload control acknowledge.
    fn recv_ctrl(&mut self, bus: &mut dyn FrameBus) -> Result<()> {
        let meta = self.recv_common(bus)?;

        if meta.kind != FrameKind::Control || meta.payload_len != 0 {
            error!("invalid control frame");
            return Err(Error::UnexpectedFrameType);
        }

        Ok(())
    }

    /// Transmit a zero-payload control frame acknowledging `rx_seq`.
    ///
    /// The outgoing control frame is assembled in the shared buffer, on top
    /// of the data frame just received; the bytes it overwrites are saved
    /// first and restored afterwards so the caller's payload stays intact.
    fn send_ack(&mut self, bus: &mut dyn FrameBus) -> Result<()> {
        let mut saved = [0u8; CTRL_FRAME_LEN];
        saved.copy_from_slice(&self.buf[..CTRL_FRAME_LEN]);

        let total = frame::encode_into(
            &mut self.buf,
            FrameKind::Control,
            SeqCtl::Ack,
            0,
            self.rx_seq,
            &[],
        );
        let res = bus.write_frame(&self.buf[..total]);

        self.buf[..CTRL_FRAME_LEN].copy_from_slice(&saved);

        if res.is_err() {
            warn!("failed to acknowledge data frame");
        }
        res
    }
}
