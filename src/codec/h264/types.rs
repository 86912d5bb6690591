use crate::codec::es::EsUnit;

/// NAL unit types (Rec. ITU-T H.264 table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Unspecified
    Unspecified = 0,
    /// Coded slice of a non-IDR picture
    CodedSliceNonIdr = 1,
    /// Coded slice data partition A
    CodedSliceDataPartitionA = 2,
    /// Coded slice data partition B
    CodedSliceDataPartitionB = 3,
    /// Coded slice data partition C
    CodedSliceDataPartitionC = 4,
    /// Coded slice of an IDR picture
    CodedSliceIdr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    AccessUnitDelimiter = 9,
    /// End of sequence
    EndOfSequence = 10,
    /// End of stream
    EndOfStream = 11,
    /// Filler data
    FillerData = 12,
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::CodedSliceNonIdr,
            2 => Self::CodedSliceDataPartitionA,
            3 => Self::CodedSliceDataPartitionB,
            4 => Self::CodedSliceDataPartitionC,
            5 => Self::CodedSliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            _ => Self::Unspecified,
        }
    }
}

impl NalUnitType {
    /// True for the VCL types (coded slices).
    pub fn is_vcl(self) -> bool {
        matches!(
            self,
            Self::CodedSliceNonIdr
                | Self::CodedSliceDataPartitionA
                | Self::CodedSliceDataPartitionB
                | Self::CodedSliceDataPartitionC
                | Self::CodedSliceIdr
        )
    }
}

/// One NAL unit: its parsed one-byte header plus the carrying ES unit.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// nal_unit_type (5 bits)
    pub nal_type: NalUnitType,
    /// nal_ref_idc (2 bits)
    pub nal_ref_idc: u8,
    /// The ES unit; `data[3]` is the NAL header byte
    pub unit: EsUnit,
    /// Parsed slice-header prefix fields for VCL units, when they parsed
    pub slice: Option<SliceHeaderPrefix>,
}

impl NalUnit {
    /// True for coded slice units.
    pub fn is_vcl(&self) -> bool {
        self.nal_type.is_vcl()
    }

    /// True for IDR slices and parameter sets.
    pub fn is_keyframe_related(&self) -> bool {
        matches!(
            self.nal_type,
            NalUnitType::CodedSliceIdr | NalUnitType::Sps | NalUnitType::Pps
        )
    }
}

/// The sequence parameter set fields this toolkit uses.
#[derive(Debug, Clone, Default)]
pub struct SpsInfo {
    /// seq_parameter_set_id
    pub sps_id: u32,
    /// profile_idc
    pub profile_idc: u8,
    /// level_idc
    pub level_idc: u8,
    /// Frame width in luma samples (before cropping)
    pub width: u32,
    /// Frame height in luma samples (before cropping)
    pub height: u32,
    /// log2_max_frame_num_minus4 + 4
    pub log2_max_frame_num: u8,
    /// pic_order_cnt_type
    pub pic_order_cnt_type: u32,
    /// log2_max_pic_order_cnt_lsb_minus4 + 4 (type 0 only)
    pub log2_max_pic_order_cnt_lsb: u8,
    /// delta_pic_order_always_zero_flag (type 1 only)
    pub delta_pic_order_always_zero: bool,
    /// frame_mbs_only_flag
    pub frame_mbs_only: bool,
    /// separate_colour_plane_flag (4:4:4 profiles)
    pub separate_colour_plane: bool,
}

/// The picture parameter set fields this toolkit uses.
#[derive(Debug, Clone, Default)]
pub struct PpsInfo {
    /// pic_parameter_set_id
    pub pps_id: u32,
    /// seq_parameter_set_id this PPS refers to
    pub sps_id: u32,
    /// entropy_coding_mode_flag
    pub entropy_coding_mode: bool,
}

/// The slice-header prefix fields that decide access-unit boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeaderPrefix {
    /// first_mb_in_slice
    pub first_mb_in_slice: u32,
    /// slice_type (possibly +5 "all slices same type" form)
    pub slice_type: u32,
    /// pic_parameter_set_id
    pub pps_id: u32,
    /// frame_num
    pub frame_num: u32,
    /// field_pic_flag (false when frame_mbs_only)
    pub field_pic: bool,
    /// bottom_field_flag
    pub bottom_field: bool,
    /// idr_pic_id for IDR slices
    pub idr_pic_id: Option<u32>,
    /// pic_order_cnt_lsb (type 0) or delta_pic_order_cnt[0] (type 1)
    pub pic_order_cnt: i64,
}

impl SliceHeaderPrefix {
    /// True when `other` starts a new picture per the boundary rule
    /// (frame_num, PPS id, field/bottom flags or picture order differ).
    pub fn differs_from(&self, other: &SliceHeaderPrefix) -> bool {
        self.frame_num != other.frame_num
            || self.pps_id != other.pps_id
            || self.field_pic != other.field_pic
            || self.bottom_field != other.bottom_field
            || self.pic_order_cnt != other.pic_order_cnt
    }
}

/// One access unit: every NAL unit contributing to one decoded picture.
#[derive(Debug, Clone)]
pub struct H264AccessUnit {
    /// NAL units in stream order
    pub nal_units: Vec<NalUnit>,
    /// Index into `nal_units` of the first VCL slice
    pub primary_slice: Option<usize>,
    /// Contains an IDR slice
    pub contains_idr: bool,
    /// Contains an SPS or PPS
    pub contains_parameter_sets: bool,
    /// field_pic_flag of the primary slice
    pub field_pic: bool,
    /// bottom_field_flag of the primary slice
    pub bottom_field: bool,
    /// frame_num of the primary slice
    pub frame_num: Option<u32>,
    /// True when two field access units were merged
    pub was_merged: bool,
}

impl H264AccessUnit {
    /// The primary slice's NAL unit, if the AU has one.
    pub fn primary_slice_nal(&self) -> Option<&NalUnit> {
        self.primary_slice.map(|i| &self.nal_units[i])
    }

    /// Total byte size of the access unit's units.
    pub fn byte_len(&self) -> usize {
        self.nal_units.iter().map(|n| n.unit.data.len()).sum()
    }
}
