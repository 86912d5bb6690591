#![doc(html_root_url = "https://docs.rs/tsio/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tsio - MPEG-2 container toolkit
//!
//! `tsio` is a toolkit for reading, analyzing, transforming and streaming
//! MPEG-2 containers: ISO/IEC 13818-1 Transport Stream (TS), Program Stream
//! (PS), Packetised Elementary Stream (PES), and raw Elementary Stream (ES)
//! carrying H.262 (MPEG-2 Video) or H.264 (AVC) video.
//!
//! ## Features
//!
//! ### Layered container reading
//! - TS packet scanning with sync validation and resynchronization
//! - PAT/PMT reassembly across fragmented TS payloads
//! - PES demultiplexing for a chosen program, with PTS/DTS/ESCR extraction
//! - ES presentation with absolute position reporting and start-code scanning
//! - H.262 picture aggregation and H.264 access-unit aggregation, including
//!   field-pair merging
//!
//! ### Paced output
//! - A single-producer/single-consumer pacing ring of TS packet bundles
//! - Release times synthesized from embedded Program Clock References so UDP
//!   emission matches the original stream's wall-clock rate
//! - Optional RTP (MP2T) encapsulation
//!
//! ### Stream analysis
//! - Continuity-counter auditing with duplicate tolerance
//! - PCR/PTS/DTS divergence tracking with mod-2^33 wrap awareness
//! - Linear PCR prediction and windowed bitrate measurement
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tsio::format::ts::{TsDemuxer, TsReader, DemuxConfig};
//! use tokio::fs::File;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = File::open("input.ts").await?;
//!     let reader = TsReader::new(file);
//!     let mut demux = TsDemuxer::new(reader, DemuxConfig::default());
//!
//!     while let Some(pes) = demux.next_pes_packet().await? {
//!         println!("PES stream_id=0x{:02x} pts={:?}", pes.stream_id(), pes.pts());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! - `format`: container implementations — TS reading/writing, PS reading,
//!   PSI reassembly, PES framing, RTP header marshalling
//! - `codec`: elementary stream handling — start-code scanning, H.262
//!   pictures, H.264 access units
//! - `pace`: the PCR-paced output engine (ring buffer, pacer, UDP emitter)
//! - `error`: error types and the crate-wide `Result` alias
//! - `utils`: bit-level reading, MPEG-2 CRC-32, timestamp wrap arithmetic

/// Elementary stream handling: start-code scanning, H.262 and H.264 units
pub mod codec;

/// Error types and utilities
pub mod error;

/// Container format implementations (TS, PS, PES, RTP)
pub mod format;

/// PCR-paced output engine
pub mod pace;

/// Common utilities and helper functions
pub mod utils;

pub use error::{Result, TsioError};
