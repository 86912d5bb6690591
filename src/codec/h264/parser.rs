use super::types::{PpsInfo, SliceHeaderPrefix, SpsInfo};
use crate::error::{Result, TsioError};
use crate::utils::bits::BitReader;
use std::collections::HashMap;

/// Parses parameter sets and slice-header prefixes, keeping the SPS/PPS
/// dictionaries the slice parsing needs.
#[derive(Debug, Default)]
pub struct H264Parser {
    sps: HashMap<u32, SpsInfo>,
    pps: HashMap<u32, PpsInfo>,
    scratch: Vec<u8>,
}

impl H264Parser {
    /// Creates a parser with empty parameter-set dictionaries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strips emulation-prevention bytes (00 00 03 -> 00 00) from an
    /// escaped byte sequence.
    pub fn unescape_rbsp(&mut self, data: &[u8]) -> Vec<u8> {
        self.scratch.clear();
        self.scratch.reserve(data.len());
        let mut i = 0;
        while i < data.len() {
            if i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03
            {
                self.scratch.push(0x00);
                self.scratch.push(0x00);
                i += 3;
                continue;
            }
            self.scratch.push(data[i]);
            i += 1;
        }
        std::mem::take(&mut self.scratch)
    }

    /// Parses an SPS RBSP (the bytes after the NAL header) and stores it.
    pub fn parse_sps(&mut self, rbsp: &[u8]) -> Result<&SpsInfo> {
        let mut reader = BitReader::new(rbsp);

        let profile_idc = reader.read_bits(8)? as u8;
        reader.skip_bits(8)?; // constraint flags and reserved bits
        let level_idc = reader.read_bits(8)? as u8;
        let sps_id = reader.read_golomb()?;

        let mut separate_colour_plane = false;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138
        ) {
            let chroma_format_idc = reader.read_golomb()?;
            if chroma_format_idc == 3 {
                separate_colour_plane = reader.read_bits(1)? == 1;
            }
            reader.read_golomb()?; // bit_depth_luma_minus8
            reader.read_golomb()?; // bit_depth_chroma_minus8
            reader.read_bits(1)?; // qpprime_y_zero_transform_bypass_flag
            if reader.read_bits(1)? == 1 {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for index in 0..count {
                    if reader.read_bits(1)? == 1 {
                        let size = if index < 6 { 16 } else { 64 };
                        skip_scaling_list(&mut reader, size)?;
                    }
                }
            }
        }

        let log2_max_frame_num = reader.read_golomb()? as u8 + 4;
        let pic_order_cnt_type = reader.read_golomb()?;

        let mut log2_max_pic_order_cnt_lsb = 0;
        let mut delta_pic_order_always_zero = false;
        if pic_order_cnt_type == 0 {
            log2_max_pic_order_cnt_lsb = reader.read_golomb()? as u8 + 4;
        } else if pic_order_cnt_type == 1 {
            delta_pic_order_always_zero = reader.read_bits(1)? == 1;
            reader.read_signed_golomb()?; // offset_for_non_ref_pic
            reader.read_signed_golomb()?; // offset_for_top_to_bottom_field
            let cycle_len = reader.read_golomb()?;
            for _ in 0..cycle_len {
                reader.read_signed_golomb()?;
            }
        }

        reader.read_golomb()?; // max_num_ref_frames
        reader.read_bits(1)?; // gaps_in_frame_num_value_allowed_flag

        let pic_width_in_mbs = reader.read_golomb()? + 1;
        let pic_height_in_map_units = reader.read_golomb()? + 1;
        let frame_mbs_only = reader.read_bits(1)? == 1;

        let sps = SpsInfo {
            sps_id,
            profile_idc,
            level_idc,
            width: pic_width_in_mbs * 16,
            height: (2 - u32::from(frame_mbs_only)) * pic_height_in_map_units * 16,
            log2_max_frame_num,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb,
            delta_pic_order_always_zero,
            frame_mbs_only,
            separate_colour_plane,
        };
        self.sps.insert(sps_id, sps);
        Ok(&self.sps[&sps_id])
    }

    /// Parses a PPS RBSP and stores it.
    pub fn parse_pps(&mut self, rbsp: &[u8]) -> Result<&PpsInfo> {
        let mut reader = BitReader::new(rbsp);
        let pps_id = reader.read_golomb()?;
        let sps_id = reader.read_golomb()?;
        let entropy_coding_mode = reader.read_bits(1)? == 1;

        let pps = PpsInfo {
            pps_id,
            sps_id,
            entropy_coding_mode,
        };
        self.pps.insert(pps_id, pps);
        Ok(&self.pps[&pps_id])
    }

    /// The stored SPS with `sps_id`, if seen.
    pub fn sps(&self, sps_id: u32) -> Option<&SpsInfo> {
        self.sps.get(&sps_id)
    }

    /// The stored PPS with `pps_id`, if seen.
    pub fn pps(&self, pps_id: u32) -> Option<&PpsInfo> {
        self.pps.get(&pps_id)
    }

    /// Parses the slice-header prefix of a VCL RBSP.
    ///
    /// Needs the active SPS/PPS; an unknown pic_parameter_set_id is an
    /// error the caller turns into a skipped NAL.
    pub fn parse_slice_prefix(&self, rbsp: &[u8], is_idr: bool) -> Result<SliceHeaderPrefix> {
        let mut reader = BitReader::new(rbsp);
        let first_mb_in_slice = reader.read_golomb()?;
        let slice_type = reader.read_golomb()?;
        let pps_id = reader.read_golomb()?;

        let pps = self
            .pps
            .get(&pps_id)
            .ok_or_else(|| TsioError::Nal(format!("slice references unknown PPS {}", pps_id)))?;
        let sps = self.sps.get(&pps.sps_id).ok_or_else(|| {
            TsioError::Nal(format!("PPS {} references unknown SPS {}", pps_id, pps.sps_id))
        })?;

        if sps.separate_colour_plane {
            reader.read_bits(2)?; // colour_plane_id
        }

        let frame_num = reader.read_bits(sps.log2_max_frame_num)?;

        let mut field_pic = false;
        let mut bottom_field = false;
        if !sps.frame_mbs_only {
            field_pic = reader.read_bits(1)? == 1;
            if field_pic {
                bottom_field = reader.read_bits(1)? == 1;
            }
        }

        let idr_pic_id = if is_idr {
            Some(reader.read_golomb()?)
        } else {
            None
        };

        let pic_order_cnt = match sps.pic_order_cnt_type {
            0 => i64::from(reader.read_bits(sps.log2_max_pic_order_cnt_lsb)?),
            1 if !sps.delta_pic_order_always_zero => {
                i64::from(reader.read_signed_golomb()?)
            }
            _ => 0,
        };

        Ok(SliceHeaderPrefix {
            first_mb_in_slice,
            slice_type,
            pps_id,
            frame_num,
            field_pic,
            bottom_field,
            idr_pic_id,
            pic_order_cnt,
        })
    }
}

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_signed_golomb()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }
    Ok(())
}
