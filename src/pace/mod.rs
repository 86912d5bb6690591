//! # PCR-paced output
//!
//! The producer/consumer engine that replays a Transport Stream onto the
//! network at its original wall-clock rate:
//!
//! - [`PacingBuffer`]: a fixed-capacity single-producer/single-consumer
//!   ring of TS packet bundles, with staged-vs-published slots and an
//!   in-band EOS item
//! - [`PcrPacer`]: synthesizes per-item departure times from observed PCRs
//!   (or a nominal byte rate), with priming, wrap and discontinuity
//!   handling, and optional PCR scaling
//! - [`PacedSender`] / [`run_consumer`]: the two cooperating tasks, UDP
//!   emission and optional RTP encapsulation

/// The pacing ring buffer
pub mod buffer;
/// Producer/consumer tasks and network emission
pub mod output;
/// Release-time computation from PCRs
pub mod pacer;

pub use buffer::{PacingBuffer, PacingItem, DEFAULT_PACKETS_PER_ITEM, MAX_PACKETS_PER_ITEM};
pub use output::{run_consumer, spawn_consumer, ConsumerStats, DatagramSink, PacedSender, UdpSink};
pub use pacer::{PaceConfig, PcrMode, PcrPacer};
