//! # MPEG-2 Transport Stream
//!
//! The TS layer of the toolkit:
//!
//! - [`TsReader`]: 188-byte packet scanning with resynchronization
//! - [`TsPacketParser`]: header / adaptation-field / PCR field parsing
//! - [`SectionAssembler`]: PAT/PMT reassembly across packets
//! - [`TsDemuxer`]: program selection and PES packet delivery
//! - [`TsMuxer`]: PSI and PES serialization back to TS
//! - [`StreamAnalyzer`]: continuity, timing and bitrate auditing

/// TS demultiplexing to PES packets
pub mod demuxer;
/// TS packetization of PSI sections and PES packets
pub mod muxer;
/// TS header and adaptation field parsing
pub mod parser;
/// PES packet framing
pub mod pes;
/// PSI section reassembly and PAT/PMT parsing
pub mod psi;
/// Packet-level reading with sync recovery
pub mod reader;
/// Stream statistics and buffering analysis
pub mod stats;
/// TS data model and constants
pub mod types;

pub use demuxer::{DemuxConfig, PcrObservation, PmtHandle, TsDemuxer};
pub use muxer::TsMuxer;
pub use parser::{SplitPacket, TsPacketParser};
pub use pes::{PesHeader, PesPacket};
pub use psi::{parse_pat_section, parse_pmt_section, SectionAssembler};
pub use reader::TsReader;
pub use stats::{AnalyzerConfig, AnalyzerReport, StreamAnalyzer, StreamStats};
pub use types::*;
