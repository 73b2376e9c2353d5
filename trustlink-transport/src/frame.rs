//! Data-Link Frame Codec
//!
//! Encodes and decodes the smallest addressable unit on the bus.
//!
//! Frame format:
//! - FCTR (1 byte): frame control field
//! - LEN (2 bytes, big-endian): payload length
//! - DATA (LEN bytes)
//! - FCS (2 bytes, big-endian): frame check sequence over FCTR..DATA
//!
//! FCTR bit layout: `[7]` frame type, `[6:5]` sequence control,
//! `[3:2]` frame number, `[1:0]` acknowledge number.
//!
//! The FCS is a fixed 16-bit check specific to this protocol family. It is
//! appended high byte first; the protocol document describes the order as
//! low byte first, but real devices expect big-endian. Do not "fix" this.

use crate::error::{Error, Result};

/// Length of the FCTR field
pub const FCTR_LEN: usize = 1;

/// Length of the LEN field
pub const LEN_LEN: usize = 2;

/// Length of the FCS field
pub const FCS_LEN: usize = 2;

/// Offset of the payload within a frame
pub const PAYLOAD_OFFSET: usize = FCTR_LEN + LEN_LEN;

/// Fixed per-frame overhead (header + trailer)
pub const FRAME_OVERHEAD: usize = FCTR_LEN + LEN_LEN + FCS_LEN;

/// Length of a control frame; also the minimum length of any valid frame
pub const CTRL_FRAME_LEN: usize = FRAME_OVERHEAD;

const FCTR_FTYPE_MASK: u8 = 0x80;
const FCTR_SEQCTL_MASK: u8 = 0x60;
const FCTR_FRNR_MASK: u8 = 0x0C;
const FCTR_ACKNR_MASK: u8 = 0x03;

/// Frame type field of the FCTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Frame carrying payload bytes
    Data = 0x00,

    /// Zero-payload control frame (acknowledge/synchronization)
    Control = 0x80,
}

/// Sequence control field of the FCTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SeqCtl {
    /// Acknowledge the frame number in the ack field
    Ack = 0x00,

    /// Negative acknowledge
    Nak = 0x20,

    /// Link reset request
    Reset = 0x40,
}

impl SeqCtl {
    fn from_fctr(fctr: u8) -> Option<Self> {
        match fctr & FCTR_SEQCTL_MASK {
            0x00 => Some(SeqCtl::Ack),
            0x20 => Some(SeqCtl::Nak),
            0x40 => Some(SeqCtl::Reset),
            _ => None,
        }
    }
}

/// A decoded frame borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// Frame type
    pub kind: FrameKind,

    /// Sequence control flags
    pub seqctl: SeqCtl,

    /// Send sequence number of this frame (0..=3)
    pub seq: u8,

    /// Acknowledge number carried by this frame (0..=3)
    pub ack: u8,

    /// Payload bytes (empty for control frames)
    pub payload: &'a [u8],
}

/// One step of the frame check sequence.
///
/// Seed is 0; each byte is folded in through a nonlinear feedback function.
/// This is the closed form of the check the device family implements in
/// silicon; a generic CRC-16 is not a substitute.
fn fcs_step(seed: u16, b: u8) -> u16 {
    let h1 = (seed ^ u16::from(b)) & 0xFF;
    let h2 = h1 & 0x0F;
    let h3 = (h2 << 4) ^ h1;
    let h4 = h3 >> 4;

    (((((h3 << 1) ^ h4) << 4) ^ h2) << 3) ^ h4 ^ (seed >> 8)
}

/// Compute the frame check sequence over `bytes`
pub fn fcs(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0, |seed, b| fcs_step(seed, *b))
}

/// Write the FCTR byte into `buf[0]`
///
/// `seq` and `ack` must already be reduced mod 4.
fn set_fctr(buf: &mut [u8], kind: FrameKind, seqctl: SeqCtl, seq: u8, ack: u8) {
    debug_assert!(seq & !0x03 == 0, "invalid frame number");
    debug_assert!(ack & !0x03 == 0, "invalid ack number");

    buf[0] = kind as u8 | seqctl as u8 | (seq << 2) | ack;
}

/// Encode one frame into `buf`, returning the total frame length.
///
/// `buf` must hold at least `payload.len() + FRAME_OVERHEAD` bytes; the
/// caller has already checked the payload against the negotiated size.
pub fn encode_into(
    buf: &mut [u8],
    kind: FrameKind,
    seqctl: SeqCtl,
    seq: u8,
    ack: u8,
    payload: &[u8],
) -> usize {
    let total = payload.len() + FRAME_OVERHEAD;
    debug_assert!(buf.len() >= total, "frame buffer too small");

    set_fctr(buf, kind, seqctl, seq, ack);
    buf[FCTR_LEN..PAYLOAD_OFFSET].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);

    let check = fcs(&buf[..PAYLOAD_OFFSET + payload.len()]);
    buf[PAYLOAD_OFFSET + payload.len()..total].copy_from_slice(&check.to_be_bytes());

    total
}

/// Convenience wrapper returning the encoded frame as a fresh vector
pub fn encode(kind: FrameKind, seqctl: SeqCtl, seq: u8, ack: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; payload.len() + FRAME_OVERHEAD];
    encode_into(&mut buf, kind, seqctl, seq, ack, payload);
    buf
}

/// Decode and verify one frame.
///
/// The length is checked before any field is trusted, then the checksum,
/// then the length field against the received byte count.
pub fn decode(bytes: &[u8]) -> Result<FrameRef<'_>> {
    if bytes.len() < CTRL_FRAME_LEN {
        return Err(Error::TooShort(bytes.len()));
    }

    let body_len = bytes.len() - FCS_LEN;
    let received = u16::from_be_bytes([bytes[body_len], bytes[body_len + 1]]);
    if fcs(&bytes[..body_len]) != received {
        return Err(Error::Checksum);
    }

    let fctr = bytes[0];
    let kind = if fctr & FCTR_FTYPE_MASK == 0 {
        FrameKind::Data
    } else {
        FrameKind::Control
    };
    let seqctl = SeqCtl::from_fctr(fctr).ok_or(Error::UnexpectedFrameType)?;

    let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    if len + FRAME_OVERHEAD != bytes.len() {
        return Err(Error::BadLength);
    }

    Ok(FrameRef {
        kind,
        seqctl,
        seq: (fctr & FCTR_FRNR_MASK) >> 2,
        ack: fctr & FCTR_ACKNR_MASK,
        payload: &bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len],
    })
}

/// Frame type of a raw frame, without full validation
pub fn is_control(frame: &[u8]) -> bool {
    frame[0] & FCTR_FTYPE_MASK != 0
}

/// LEN field of a raw frame, without full validation
pub fn frame_len(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[1], frame[2]])
}
