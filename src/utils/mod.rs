//! # Utility Functions and Types
//!
//! Common utilities used throughout the tsio library:
//!
//! - Bit-level reading with Exp-Golomb support (`bits`)
//! - MPEG-2 CRC-32 for PSI table validation (`crc`)
//! - Wrap-aware 33-bit / 42-bit clock arithmetic (`clock`)

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// Wrap-aware timestamp and PCR arithmetic
pub mod clock;

/// CRC calculation implementations
pub mod crc;

pub use bits::BitReader;
pub use clock::{pcr_diff, pcr_later, ticks_90k_diff, Pcr};
pub use crc::Crc32Mpeg2;
