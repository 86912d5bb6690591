//! # Error Types
//!
//! The central error type [`TsioError`] covers both fatal conditions (I/O
//! failure, lost sync) and the format-level conditions that individual
//! components recover from locally but may still need to surface.
//!
//! Recoverable conditions — a bad section CRC, a continuity gap, a broken
//! NAL unit — are normally counted and logged where they occur; the variants
//! here exist for the cases where a caller asked for strictness or where no
//! forward progress is possible.

use thiserror::Error;

/// Primary error type for the tsio library
#[derive(Error, Debug)]
pub enum TsioError {
    /// Underlying byte source failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No 0x47 sync raster could be located within the scan budget
    #[error("sync error: {0}")]
    Sync(String),

    /// A PSI section failed its CRC or length checks
    #[error("malformed section on pid {pid:#06x}: {reason}")]
    Section {
        /// PID the section was being reassembled on
        pid: u16,
        /// What went wrong
        reason: String,
    },

    /// Continuity counter gap with payload and no discontinuity flag
    #[error("continuity error on pid {pid:#06x}: expected cc {expected}, got {got}")]
    Continuity {
        /// PID the gap was observed on
        pid: u16,
        /// Counter value the previous packet implied
        expected: u8,
        /// Counter value actually seen
        got: u8,
    },

    /// More than the single permitted duplicate packet
    #[error("duplicate packet on pid {pid:#06x} at offset {offset}")]
    Duplicate {
        /// PID the duplicate was observed on
        pid: u16,
        /// Byte offset of the offending packet
        offset: u64,
    },

    /// PCR regression, oversized gap, or prediction divergence
    #[error("pcr error: {0}")]
    Pcr(String),

    /// Two successive field pictures whose temporal references disagree
    #[error("field pairing error: temporal references {first} and {second} do not match")]
    FieldPairing {
        /// Temporal reference of the field kept
        first: u16,
        /// Temporal reference of the field that failed to pair
        second: u16,
    },

    /// A NAL unit with a set forbidden bit or a truncated RBSP
    #[error("broken NAL unit: {0}")]
    Nal(String),

    /// The pacing ring filled without any PCR ever being observed
    #[error("pacing buffer jammed: ring full before the first PCR was seen")]
    BufferJammed,

    /// Errors that occur during parsing of container structures
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// A specialized Result type for tsio operations.
pub type Result<T> = std::result::Result<T, TsioError>;
