//! # H.264 (AVC) NAL unit and access unit handling
//!
//! A [`NalReader`] lifts start-code-delimited units into parsed NAL units,
//! maintaining the SPS/PPS dictionaries that slice-header parsing needs.
//! [`H264AccessUnitBuilder`] groups NAL units into access units using the
//! AU-delimiter and first-slice boundary rules, and can merge complementary
//! field pairs into frames.

mod au;
mod parser;
mod types;

pub use au::{H264AccessUnitBuilder, NalReader};
pub use parser::H264Parser;
pub use types::{H264AccessUnit, NalUnit, NalUnitType, PpsInfo, SliceHeaderPrefix, SpsInfo};
