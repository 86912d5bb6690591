//! # Container Format Implementations
//!
//! This module provides the container layers of the toolkit:
//!
//! - **TS**: MPEG-2 Transport Stream reading, writing, PSI reassembly,
//!   PES demultiplexing and stream analysis
//! - **PS**: MPEG-2 Program Stream reading
//! - **RTP**: header marshalling for MP2T-over-RTP emission
//!
//! ## Examples
//!
//! ### Demultiplexing a Transport Stream
//!
//! ```rust,no_run
//! use tsio::format::ts::{DemuxConfig, TsDemuxer, TsReader};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file = tokio::fs::File::open("input.ts").await?;
//! let mut demux = TsDemuxer::new(TsReader::new(file), DemuxConfig::default());
//! while let Some(pes) = demux.next_pes_packet().await? {
//!     println!("PES of {} bytes on pid {:#06x}", pes.payload.len(), pes.pid);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::Result;

/// MPEG-2 Program Stream (pack-framed) reading
pub mod ps;
/// RTP header marshalling for MP2T datagrams
pub mod rtp;
/// MPEG-2 Transport Stream format implementation
pub mod ts;

/// A source of reassembled PES packets.
///
/// Both the TS demultiplexer and the PS reader implement this, so the
/// elementary-stream layer above can be container-agnostic.
#[async_trait::async_trait]
pub trait PesSource: Send {
    /// Returns the next PES packet for the selected stream, or `None` at the
    /// end of the source.
    async fn next_pes_packet(&mut self) -> Result<Option<ts::PesPacket>>;
}

pub use self::ps::PsReader;
pub use self::rtp::RtpHeader;
pub use self::ts::{DemuxConfig, PesPacket, TsDemuxer, TsMuxer, TsReader};
