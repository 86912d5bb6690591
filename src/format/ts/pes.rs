use crate::error::{Result, TsioError};
use crate::utils::clock::Pcr;
use bytes::{BufMut, Bytes, BytesMut};

/// PES stream_id of the program stream map
pub const STREAM_ID_PSM: u8 = 0xBC;
/// PES stream_id of padding packets
pub const STREAM_ID_PADDING: u8 = 0xBE;
/// PES stream_id of private stream 2
pub const STREAM_ID_PRIVATE_2: u8 = 0xBF;
/// First PES stream_id of the audio range (0xC0..=0xDF)
pub const STREAM_ID_AUDIO_FIRST: u8 = 0xC0;
/// First PES stream_id of the video range (0xE0..=0xEF)
pub const STREAM_ID_VIDEO_FIRST: u8 = 0xE0;

/// True for the stream_ids whose PES packets carry no optional header.
pub fn has_plain_header(stream_id: u8) -> bool {
    matches!(
        stream_id,
        STREAM_ID_PSM | STREAM_ID_PADDING | STREAM_ID_PRIVATE_2 | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF
    )
}

/// True for stream_ids in the video range.
pub fn is_video_stream_id(stream_id: u8) -> bool {
    (0xE0..=0xEF).contains(&stream_id)
}

/// The parsed optional header of a PES packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PesHeader {
    /// stream_id following the 00 00 01 prefix
    pub stream_id: u8,
    /// PES_packet_length as on the wire; 0 means unbounded (video only)
    pub packet_length: u16,
    /// data_alignment_indicator
    pub data_alignment: bool,
    /// 33-bit presentation timestamp (90 kHz)
    pub pts: Option<u64>,
    /// 33-bit decoding timestamp (90 kHz)
    pub dts: Option<u64>,
    /// Elementary stream clock reference (27 MHz, extended)
    pub escr: Option<Pcr>,
    /// Total header bytes, i.e. the offset of the payload from the start code
    pub header_len: usize,
}

/// A reassembled PES packet together with its source coordinates.
#[derive(Debug, Clone)]
pub struct PesPacket {
    /// PID the packet arrived on (0 when read from a Program Stream)
    pub pid: u16,
    /// Parsed header
    pub header: PesHeader,
    /// The elementary stream bytes after the PES header
    pub payload: Bytes,
    /// Byte offset in the source of the packet's first byte
    pub source_offset: u64,
    /// Index of the first TS packet of this PES packet (0 for PS)
    pub source_index: u64,
}

impl PesPacket {
    /// stream_id shorthand.
    pub fn stream_id(&self) -> u8 {
        self.header.stream_id
    }

    /// PTS shorthand.
    pub fn pts(&self) -> Option<u64> {
        self.header.pts
    }

    /// DTS shorthand.
    pub fn dts(&self) -> Option<u64> {
        self.header.dts
    }
}

/// Reads a 5-byte 33-bit timestamp field, validating the 4-bit prefix.
fn parse_timestamp(data: &[u8], expected_prefix: u8) -> Result<u64> {
    if data.len() < 5 {
        return Err(TsioError::Parser("timestamp field truncated".into()));
    }
    if data[0] >> 4 != expected_prefix {
        return Err(TsioError::Parser(format!(
            "timestamp prefix {:#x} where {:#x} expected",
            data[0] >> 4,
            expected_prefix
        )));
    }
    Ok((u64::from(data[0] & 0x0E) << 29)
        | (u64::from(data[1]) << 22)
        | (u64::from(data[2] & 0xFE) << 14)
        | (u64::from(data[3]) << 7)
        | (u64::from(data[4]) >> 1))
}

/// Writes a 5-byte timestamp field with the given 4-bit prefix.
fn write_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.put_u8((prefix << 4) | ((ts >> 29) & 0x0E) as u8 | 0x01);
    buf.put_u16((((ts >> 14) & 0xFFFE) | 0x01) as u16);
    buf.put_u16((((ts << 1) & 0xFFFE) | 0x01) as u16);
}

impl PesHeader {
    /// Parses a PES header from bytes beginning with `00 00 01 stream_id`.
    ///
    /// For the stream_ids with no optional header the payload starts right
    /// after the length field.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(TsioError::Parser("PES header truncated".into()));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return Err(TsioError::Parser("missing PES start code prefix".into()));
        }

        let stream_id = data[3];
        let packet_length = (u16::from(data[4]) << 8) | u16::from(data[5]);

        let mut header = Self {
            stream_id,
            packet_length,
            ..Default::default()
        };

        if has_plain_header(stream_id) {
            header.header_len = 6;
            return Ok(header);
        }

        if data.len() < 9 {
            return Err(TsioError::Parser("PES optional header truncated".into()));
        }
        if data[6] >> 6 != 0b10 {
            return Err(TsioError::Parser(
                "PES optional header marker bits missing".into(),
            ));
        }

        header.data_alignment = data[6] & 0x04 != 0;
        let pts_dts_flags = data[7] >> 6;
        let escr_flag = data[7] & 0x20 != 0;
        let header_data_length = data[8] as usize;
        header.header_len = 9 + header_data_length;

        if data.len() < header.header_len {
            return Err(TsioError::Parser("PES header fields truncated".into()));
        }

        let mut pos = 9;
        match pts_dts_flags {
            0b10 => {
                header.pts = Some(parse_timestamp(&data[pos..], 0b0010)?);
                pos += 5;
            }
            0b11 => {
                header.pts = Some(parse_timestamp(&data[pos..], 0b0011)?);
                pos += 5;
                header.dts = Some(parse_timestamp(&data[pos..], 0b0001)?);
                pos += 5;
            }
            0b01 => {
                return Err(TsioError::Parser("forbidden PTS_DTS_flags 01".into()));
            }
            _ => {}
        }

        if escr_flag {
            if pos + 6 > data.len() {
                return Err(TsioError::Parser("ESCR field truncated".into()));
            }
            let b = &data[pos..pos + 6];
            let base = (u64::from(b[0] & 0x38) << 27)
                | (u64::from(b[0] & 0x03) << 28)
                | (u64::from(b[1]) << 20)
                | (u64::from(b[2] & 0xF8) << 12)
                | (u64::from(b[2] & 0x03) << 13)
                | (u64::from(b[3]) << 5)
                | (u64::from(b[4]) >> 3);
            let ext = (u16::from(b[4] & 0x03) << 7) | (u16::from(b[5]) >> 1);
            header.escr = Some(Pcr::from_parts(base, ext));
        }

        Ok(header)
    }

    /// Serializes a header with the optional fields this toolkit emits
    /// (PTS/DTS only).
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);

        if has_plain_header(self.stream_id) {
            return Ok(());
        }

        let mut flags0 = 0x80u8;
        if self.data_alignment {
            flags0 |= 0x04;
        }
        buf.put_u8(flags0);

        let mut flags1 = 0u8;
        let mut extra = 0u8;
        if self.pts.is_some() {
            flags1 |= 0x80;
            extra += 5;
        }
        if self.dts.is_some() {
            flags1 |= 0x40;
            extra += 5;
        }
        buf.put_u8(flags1);
        buf.put_u8(extra);

        if let Some(pts) = self.pts {
            let prefix = if self.dts.is_some() { 0b0011 } else { 0b0010 };
            write_timestamp(buf, prefix, pts);
        }
        if let Some(dts) = self.dts {
            write_timestamp(buf, 0b0001, dts);
        }

        Ok(())
    }

    /// Header length this serializer will produce for these fields.
    pub fn serialized_len(&self) -> usize {
        if has_plain_header(self.stream_id) {
            6
        } else {
            9 + if self.pts.is_some() { 5 } else { 0 } + if self.dts.is_some() { 5 } else { 0 }
        }
    }
}
