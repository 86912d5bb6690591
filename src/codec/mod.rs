//! # Elementary Stream Handling
//!
//! The codec layer sits above the containers: it reads a contiguous
//! elementary stream (from reassembled PES packets or a raw file), splits it
//! at `00 00 01` start codes, and aggregates the resulting units into
//! decoder-meaningful groupings:
//!
//! - `es`: the ES byte stream, start-code scanner and [`EsUnit`](es::EsUnit)
//! - `h262`: MPEG-2 video pictures, with field-pair merging
//! - `h264`: AVC NAL units and access units, with field-pair merging

/// ES byte stream presentation and start-code scanning
pub mod es;

/// H.262 (MPEG-2 video) picture aggregation
pub mod h262;

/// H.264 (AVC) NAL unit and access unit aggregation
pub mod h264;

pub use es::{EsOffset, EsReader, EsUnit, StartCodeScanner};
pub use h262::{H262Item, H262Picture, H262PictureBuilder};
pub use h264::{H264AccessUnit, H264AccessUnitBuilder, NalReader, NalUnit};
