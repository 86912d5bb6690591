use crate::error::{Result, TsioError};
use crate::utils::clock::Pcr;
use crate::utils::crc::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};

// PIDs
/// PID carrying the Program Association Table
pub const PID_PAT: u16 = 0x0000;
/// Null-packet PID (stuffing)
pub const PID_NULL: u16 = 0x1FFF;

// Table IDs
/// Table ID for the Program Association Table
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID for the Program Map Table
pub const TABLE_ID_PMT: u8 = 0x02;

// Elementary stream types
/// Stream type for MPEG-1 video
pub const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
/// Stream type for H.262 (MPEG-2) video
pub const STREAM_TYPE_H262: u8 = 0x02;
/// Stream type for MPEG-1 audio
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
/// Stream type for MPEG-2 audio
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
/// Stream type for AAC audio (ADTS)
pub const STREAM_TYPE_AAC: u8 = 0x0F;
/// Stream type for H.264 (AVC) video
pub const STREAM_TYPE_H264: u8 = 0x1B;
/// Stream type for AVS video
pub const STREAM_TYPE_AVS: u8 = 0x42;
/// Stream type for Dolby AC-3 audio (ATSC)
pub const STREAM_TYPE_AC3: u8 = 0x81;

// Sizes
/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// Size of the fixed Transport Stream header in bytes
pub const TS_HEADER_SIZE: usize = 4;

/// True for the stream types this toolkit treats as video.
pub fn is_video_stream_type(stream_type: u8) -> bool {
    matches!(
        stream_type,
        STREAM_TYPE_MPEG1_VIDEO | STREAM_TYPE_H262 | STREAM_TYPE_H264 | STREAM_TYPE_AVS
    )
}

/// True for the stream types this toolkit treats as audio.
pub fn is_audio_stream_type(stream_type: u8) -> bool {
    matches!(
        stream_type,
        STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO | STREAM_TYPE_AAC | STREAM_TYPE_AC3
    )
}

/// The fixed 4-byte Transport Stream packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsHeader {
    /// Always 0x47
    pub sync_byte: u8,
    /// Uncorrectable error upstream
    pub transport_error: bool,
    /// A PES packet or PSI section starts in this packet's payload
    pub payload_unit_start: bool,
    /// Priority over other packets of the same PID
    pub transport_priority: bool,
    /// 13-bit packet identifier
    pub pid: u16,
    /// 2-bit scrambling mode
    pub scrambling_control: u8,
    /// Adaptation field present
    pub has_adaptation_field: bool,
    /// Payload present
    pub has_payload: bool,
    /// 4-bit counter, incremented per payload-bearing packet of a PID
    pub continuity_counter: u8,
}

impl Default for TsHeader {
    fn default() -> Self {
        Self {
            sync_byte: 0x47,
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            has_adaptation_field: false,
            has_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TsHeader {
    /// Serializes the header into `buf` in bit-exact wire layout.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.sync_byte);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        if self.transport_priority {
            b1 |= 0x20;
        }
        b1 |= ((self.pid >> 8) & 0x1F) as u8;
        buf.put_u8(b1);
        buf.put_u8((self.pid & 0xFF) as u8);

        let mut b3 = self.scrambling_control << 6;
        if self.has_adaptation_field {
            b3 |= 0x20;
        }
        if self.has_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0F;
        buf.put_u8(b3);

        Ok(())
    }
}

/// The optional adaptation field of a Transport Stream packet.
#[derive(Debug, Clone, Default)]
pub struct AdaptationField {
    /// Field length byte (bytes following it)
    pub length: usize,
    /// Discontinuity indicator
    pub discontinuity: bool,
    /// Random access indicator
    pub random_access: bool,
    /// Elementary stream priority indicator
    pub es_priority: bool,
    /// Extended 42-bit Program Clock Reference, if present
    pub pcr: Option<Pcr>,
    /// Original PCR, if present
    pub opcr: Option<Pcr>,
    /// Packets until a splice point, if signalled
    pub splice_countdown: Option<i8>,
}

/// One 188-byte Transport Stream packet together with its source coordinates.
#[derive(Debug, Clone)]
pub struct TsPacket {
    /// The raw packet bytes; `data[0]` is always 0x47
    pub data: Bytes,
    /// Byte offset of the packet in the source
    pub offset: u64,
    /// Zero-based index of the packet in the source
    pub index: u64,
}

impl TsPacket {
    /// The 13-bit PID, read straight from the raw bytes.
    pub fn pid(&self) -> u16 {
        (u16::from(self.data[1] & 0x1F) << 8) | u16::from(self.data[2])
    }

    /// The payload_unit_start_indicator bit.
    pub fn payload_unit_start(&self) -> bool {
        self.data[1] & 0x40 != 0
    }

    /// The 4-bit continuity counter.
    pub fn continuity_counter(&self) -> u8 {
        self.data[3] & 0x0F
    }

    /// True if the adaptation_field_control bits announce a payload.
    pub fn has_payload(&self) -> bool {
        self.data[3] & 0x10 != 0
    }
}

/// One entry of the Program Association Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number; 0 names the network PID
    pub program_number: u16,
    /// PMT PID for this program (network PID when program_number is 0)
    pub pid: u16,
}

/// Program Association Table: the ordered program_number -> PMT PID mapping
/// carried on PID 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pat {
    /// transport_stream_id from the section header
    pub transport_stream_id: u16,
    /// 5-bit version_number
    pub version: u8,
    /// current_next_indicator
    pub current_next: bool,
    /// Program entries in section order
    pub entries: Vec<PatEntry>,
}

impl Pat {
    /// PMT PID for `program_number`, if the PAT lists it.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number == program_number)
            .map(|e| e.pid)
    }

    /// The first real program (program_number != 0), if any.
    pub fn first_program(&self) -> Option<&PatEntry> {
        self.entries.iter().find(|e| e.program_number != 0)
    }

    /// Serializes the complete PAT section, including the CRC field.
    ///
    /// Parsing the result yields this table again, octet for octet.
    pub fn write_section(&self, buf: &mut BytesMut) -> Result<()> {
        let section_length = 5 + self.entries.len() * 4 + 4;
        if section_length > 0x3FD {
            return Err(TsioError::InvalidData("PAT section too long".into()));
        }

        let start = buf.len();
        buf.put_u8(TABLE_ID_PAT);
        buf.put_u16(0xB000 | section_length as u16);
        buf.put_u16(self.transport_stream_id);
        let mut b5 = 0xC0 | (self.version & 0x1F) << 1;
        if self.current_next {
            b5 |= 0x01;
        }
        buf.put_u8(b5);
        buf.put_u8(0); // section_number
        buf.put_u8(0); // last_section_number

        for entry in &self.entries {
            buf.put_u16(entry.program_number);
            buf.put_u16(entry.pid & 0x1FFF | 7 << 13);
        }

        let crc = Crc32Mpeg2::new().calculate(&buf[start..]);
        buf.put_u32(crc);
        Ok(())
    }
}

/// A descriptor attached to a program or an elementary stream in the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Tag identifying the descriptor type
    pub tag: u8,
    /// Raw descriptor payload
    pub data: Vec<u8>,
}

/// One elementary stream entry of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Encoding of the elementary stream (H.262, H.264, ...)
    pub stream_type: u8,
    /// PID carrying the stream
    pub elementary_pid: u16,
    /// Descriptors scoped to this stream
    pub descriptors: Vec<Descriptor>,
}

/// Program Map Table for one program.
///
/// Snapshots are immutable once parsed; the demultiplexer replaces the whole
/// table when a newer version arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pmt {
    /// Program this table describes
    pub program_number: u16,
    /// 5-bit version_number
    pub version: u8,
    /// current_next_indicator
    pub current_next: bool,
    /// PID carrying this program's PCRs
    pub pcr_pid: u16,
    /// Descriptors scoped to the whole program
    pub program_descriptors: Vec<Descriptor>,
    /// Elementary streams in section order
    pub streams: Vec<StreamEntry>,
}

impl Pmt {
    /// The first video stream entry, if any.
    pub fn video_stream(&self) -> Option<&StreamEntry> {
        self.streams
            .iter()
            .find(|s| is_video_stream_type(s.stream_type))
    }

    /// The first audio stream entry, if any.
    pub fn audio_stream(&self) -> Option<&StreamEntry> {
        self.streams
            .iter()
            .find(|s| is_audio_stream_type(s.stream_type))
    }

    /// The entry carried on `pid`, if any.
    pub fn stream_on_pid(&self, pid: u16) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.elementary_pid == pid)
    }

    /// Serializes the complete PMT section, including the CRC field.
    pub fn write_section(&self, buf: &mut BytesMut) -> Result<()> {
        let prog_desc_len: usize = self
            .program_descriptors
            .iter()
            .map(|d| 2 + d.data.len())
            .sum();
        let streams_len: usize = self
            .streams
            .iter()
            .map(|s| 5 + s.descriptors.iter().map(|d| 2 + d.data.len()).sum::<usize>())
            .sum();
        let section_length = 9 + prog_desc_len + streams_len + 4;
        if section_length > 0x3FD {
            return Err(TsioError::InvalidData("PMT section too long".into()));
        }

        let start = buf.len();
        buf.put_u8(TABLE_ID_PMT);
        buf.put_u16(0xB000 | section_length as u16);
        buf.put_u16(self.program_number);
        let mut b5 = 0xC0 | (self.version & 0x1F) << 1;
        if self.current_next {
            b5 |= 0x01;
        }
        buf.put_u8(b5);
        buf.put_u8(0); // section_number
        buf.put_u8(0); // last_section_number
        buf.put_u16(self.pcr_pid & 0x1FFF | 7 << 13);
        buf.put_u16(prog_desc_len as u16 & 0x3FF | 0xF << 12);
        for desc in &self.program_descriptors {
            buf.put_u8(desc.tag);
            buf.put_u8(desc.data.len() as u8);
            buf.put_slice(&desc.data);
        }

        for stream in &self.streams {
            buf.put_u8(stream.stream_type);
            buf.put_u16(stream.elementary_pid & 0x1FFF | 7 << 13);
            let es_desc_len: usize = stream.descriptors.iter().map(|d| 2 + d.data.len()).sum();
            buf.put_u16(es_desc_len as u16 & 0x3FF | 0xF << 12);
            for desc in &stream.descriptors {
                buf.put_u8(desc.tag);
                buf.put_u8(desc.data.len() as u8);
                buf.put_slice(&desc.data);
            }
        }

        let crc = Crc32Mpeg2::new().calculate(&buf[start..]);
        buf.put_u32(crc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = TsHeader {
            payload_unit_start: true,
            pid: 0x1ABC & 0x1FFF,
            continuity_counter: 7,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), TS_HEADER_SIZE);
        assert_eq!(buf[0], 0x47);
        assert_eq!(buf[1] & 0x40, 0x40);
        assert_eq!(
            (u16::from(buf[1] & 0x1F) << 8) | u16::from(buf[2]),
            header.pid
        );
        assert_eq!(buf[3] & 0x0F, 7);
    }

    #[test]
    fn stream_type_classification() {
        assert!(is_video_stream_type(STREAM_TYPE_H262));
        assert!(is_video_stream_type(STREAM_TYPE_H264));
        assert!(is_video_stream_type(STREAM_TYPE_AVS));
        assert!(is_audio_stream_type(STREAM_TYPE_MPEG2_AUDIO));
        assert!(!is_video_stream_type(STREAM_TYPE_AAC));
        assert!(!is_audio_stream_type(STREAM_TYPE_H264));
    }
}
