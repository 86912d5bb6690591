//! # RTP encapsulation for MP2T datagrams
//!
//! When paced output is configured for RTP, every UDP datagram is preceded
//! by a fixed 12-byte header: version 2, no padding/extension/CSRC, marker
//! clear, payload type 33 (MP2T), a per-datagram sequence number, a 90 kHz
//! timestamp derived from the stream's PCR, and an SSRC randomized at
//! startup.

use bytes::{BufMut, BytesMut};
use rand::Rng;

/// RTP payload type for MPEG-2 Transport Stream
pub const PAYLOAD_TYPE_MP2T: u8 = 33;

/// Size of the fixed RTP header in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// Fixed-header RTP state for one outgoing stream.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// Payload type (33 for MP2T)
    pub payload_type: u8,
    /// Sequence number of the next datagram
    pub sequence_number: u16,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Creates a header generator with a random SSRC and sequence start.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_type: PAYLOAD_TYPE_MP2T,
            sequence_number: rng.gen(),
            ssrc: rng.gen(),
        }
    }

    /// Writes the 12-byte header for one datagram and advances the sequence
    /// number. `timestamp` is in 90 kHz units (PCR / 300).
    pub fn write_to(&mut self, buf: &mut BytesMut, timestamp: u32) {
        buf.put_u8(0x80); // V=2, P=0, X=0, CC=0
        buf.put_u8(self.payload_type & 0x7F); // M=0
        buf.put_u16(self.sequence_number);
        buf.put_u32(timestamp);
        buf.put_u32(self.ssrc);
        self.sequence_number = self.sequence_number.wrapping_add(1);
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self::new()
    }
}
