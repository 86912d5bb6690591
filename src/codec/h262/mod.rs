//! # H.262 (MPEG-2 Video) picture aggregation
//!
//! Collects ES units into coded pictures and sequence headers, extracts the
//! picture-level metadata the container layers care about (coding type,
//! temporal reference, picture structure, aspect ratio, AFD), and merges
//! complementary field pairs into frames.

mod parser;
mod types;

pub use parser::H262PictureBuilder;
pub use types::{
    H262Item, H262Picture, H262SequenceHeader, PictureCodingType, PictureStructure,
    EXTENSION_START_CODE, GROUP_START_CODE, PICTURE_START_CODE, SEQUENCE_END_CODE,
    SEQUENCE_HEADER_CODE, USER_DATA_START_CODE,
};
