use crate::codec::es::EsUnit;

/// picture_start_code
pub const PICTURE_START_CODE: u8 = 0x00;
/// user_data_start_code
pub const USER_DATA_START_CODE: u8 = 0xB2;
/// sequence_header_start_code
pub const SEQUENCE_HEADER_CODE: u8 = 0xB3;
/// extension_start_code
pub const EXTENSION_START_CODE: u8 = 0xB5;
/// sequence_end_code
pub const SEQUENCE_END_CODE: u8 = 0xB7;
/// group_start_code
pub const GROUP_START_CODE: u8 = 0xB8;

/// picture_coding_type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureCodingType {
    /// Intra-coded
    I,
    /// Predictive-coded
    P,
    /// Bidirectionally-predictive-coded
    B,
    /// DC intra-coded (MPEG-1 only)
    D,
    /// Reserved values
    Reserved(u8),
}

impl From<u8> for PictureCodingType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::I,
            2 => Self::P,
            3 => Self::B,
            4 => Self::D,
            other => Self::Reserved(other),
        }
    }
}

/// picture_structure from the picture coding extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStructure {
    /// Top field only
    TopField,
    /// Bottom field only
    BottomField,
    /// A whole frame
    Frame,
}

impl PictureStructure {
    /// True for either field structure.
    pub fn is_field(self) -> bool {
        matches!(self, Self::TopField | Self::BottomField)
    }

    /// The field structure that completes this one into a frame.
    pub fn complement(self) -> Option<Self> {
        match self {
            Self::TopField => Some(Self::BottomField),
            Self::BottomField => Some(Self::TopField),
            Self::Frame => None,
        }
    }
}

/// A coded picture: the picture header unit and everything up to the next
/// picture-level start code.
#[derive(Debug, Clone)]
pub struct H262Picture {
    /// I/P/B/D from the picture header
    pub coding_type: PictureCodingType,
    /// 10-bit temporal_reference from the picture header
    pub temporal_reference: u16,
    /// Frame or field, from the picture coding extension (frame pictures
    /// without an extension are progressive MPEG-1 style frames)
    pub structure: PictureStructure,
    /// progressive_frame bit of the picture coding extension
    pub progressive: bool,
    /// Active Format Description, from DTG1 user data (sticky across
    /// pictures until changed)
    pub afd: Option<u8>,
    /// True when this picture holds two merged field pictures
    pub was_merged: bool,
    /// All ES units of the picture, in stream order
    pub units: Vec<EsUnit>,
}

impl H262Picture {
    /// Total byte size of the picture's units.
    pub fn byte_len(&self) -> usize {
        self.units.iter().map(|u| u.data.len()).sum()
    }
}

/// A sequence header and its attached extension/user-data units.
#[derive(Debug, Clone)]
pub struct H262SequenceHeader {
    /// 4-bit aspect_ratio_information
    pub aspect_ratio_info: u8,
    /// progressive_sequence, when a sequence extension followed
    pub progressive_sequence: bool,
    /// Horizontal size from the header (12 bits)
    pub horizontal_size: u16,
    /// Vertical size from the header (12 bits)
    pub vertical_size: u16,
    /// The header unit plus its extensions and user data
    pub units: Vec<EsUnit>,
}

/// One item of an H.262 elementary stream at picture granularity.
#[derive(Debug, Clone)]
pub enum H262Item {
    /// A coded picture (frame or field)
    Picture(H262Picture),
    /// A sequence header with its extensions
    SequenceHeader(H262SequenceHeader),
    /// The sequence_end_code singleton
    SequenceEnd(EsUnit),
}

impl H262Item {
    /// The item's units, whatever its kind.
    pub fn units(&self) -> &[EsUnit] {
        match self {
            Self::Picture(p) => &p.units,
            Self::SequenceHeader(s) => &s.units,
            Self::SequenceEnd(u) => std::slice::from_ref(u),
        }
    }
}
