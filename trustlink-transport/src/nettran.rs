//! Network/Transport Layer
//!
//! One PCTR byte in front of every data-link payload:
//! - bits `[2:0]`: chain field — a message either fits one frame (single) or
//!   is split into first / intermediate / last segments
//! - bit `[3]`: presence flag, set once the shielded channel is active
//!
//! The channel-multiplexing bits above that are unused by this protocol
//! profile and always zero.

use tracing::{error, trace};

use crate::bus::FrameBus;
use crate::datalink::DataLink;
use crate::error::{Error, Result};
use crate::frame::FRAME_OVERHEAD;

/// Length of the PCTR header
pub const NETTRAN_HEADER_LEN: usize = 1;

const CHAIN_MASK: u8 = 0x07;
const CHAIN_NONE: u8 = 0x00;
const CHAIN_FIRST: u8 = 0x01;
const CHAIN_INTERMEDIATE: u8 = 0x02;
const CHAIN_LAST: u8 = 0x04;
const CHAIN_ERROR: u8 = 0x07;

const PRESENCE_FLAG: u8 = 0x08;

/// Network/transport layer state
#[derive(Debug, Default)]
pub struct Nettran {
    presence: bool,
}

impl Nettran {
    /// Create the layer with presence disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Nettran init hook, idempotent
    pub fn reset(&mut self) {
        self.presence = false;
    }

    /// Mark the shielded channel as active; every PCTR carries the presence
    /// flag from now on
    pub fn enable_presence(&mut self) {
        self.presence = true;
    }

    /// Whether the shielded channel is active
    pub fn presence_enabled(&self) -> bool {
        self.presence
    }

    fn pctr(&self, chain: u8) -> u8 {
        if self.presence {
            chain | PRESENCE_FLAG
        } else {
            chain
        }
    }

    /// Largest message body one frame can carry
    fn max_chunk(bus: &dyn FrameBus) -> usize {
        bus.max_frame_len() - FRAME_OVERHEAD - NETTRAN_HEADER_LEN
    }

    /// Send one APDU, chaining across frames when it does not fit one
    pub fn send(&mut self, link: &mut DataLink, bus: &mut dyn FrameBus, apdu: &[u8]) -> Result<()> {
        let max_chunk = Self::max_chunk(bus);

        if apdu.len() <= max_chunk {
            let mut packet = Vec::with_capacity(apdu.len() + NETTRAN_HEADER_LEN);
            packet.push(self.pctr(CHAIN_NONE));
            packet.extend_from_slice(apdu);
            return link.send(bus, &packet);
        }

        trace!(len = apdu.len(), max_chunk, "chaining outgoing message");
        let mut chunks = apdu.chunks(max_chunk).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let chain = if first {
                CHAIN_FIRST
            } else if chunks.peek().is_some() {
                CHAIN_INTERMEDIATE
            } else {
                CHAIN_LAST
            };
            first = false;

            let mut packet = Vec::with_capacity(chunk.len() + NETTRAN_HEADER_LEN);
            packet.push(self.pctr(chain));
            packet.extend_from_slice(chunk);
            link.send(bus, &packet)?;
        }

        Ok(())
    }

    /// Receive one APDU into `out`, reassembling a chain when the device
    /// split it, and return its length
    pub fn recv(
        &mut self,
        link: &mut DataLink,
        bus: &mut dyn FrameBus,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut total = 0usize;
        let mut chained = false;

        loop {
            let payload = link.recv(bus)?;
            if payload.is_empty() {
                error!("frame without transport header");
                return Err(Error::UnexpectedFrameType);
            }

            let chain = payload[0] & CHAIN_MASK;
            let body = &payload[1..];

            let done = match (chained, chain) {
                (false, CHAIN_NONE) => true,
                (false, CHAIN_FIRST) => {
                    chained = true;
                    false
                }
                (true, CHAIN_INTERMEDIATE) => false,
                (true, CHAIN_LAST) => true,
                (_, CHAIN_ERROR) => {
                    error!("device reported a chain error");
                    return Err(Error::UnexpectedFrameType);
                }
                _ => {
                    error!(chain, chained, "chain sequence violation");
                    return Err(Error::UnexpectedFrameType);
                }
            };

            if total + body.len() > out.len() {
                error!(
                    needed = total + body.len(),
                    available = out.len(),
                    "message exceeds caller buffer"
                );
                return Err(Error::Overflow);
            }
            out[total..total + body.len()].copy_from_slice(body);
            total += body.len();

            if done {
                return Ok(total);
            }
        }
    }
}
