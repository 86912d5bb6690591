use super::types::*;
use crate::error::{Result, TsioError};
use crate::utils::clock::Pcr;

/// Parser for the fixed header and adaptation field of TS packets.
#[derive(Debug, Default)]
pub struct TsPacketParser {}

/// The split view of one packet: header plus optional adaptation field and
/// payload slice bounds.
#[derive(Debug)]
pub struct SplitPacket {
    /// Parsed fixed header
    pub header: TsHeader,
    /// Parsed adaptation field, when present
    pub adaptation: Option<AdaptationField>,
    /// Offset of the payload within the 188 bytes, when a payload is present
    pub payload_offset: Option<usize>,
}

impl TsPacketParser {
    /// Creates a new TS packet parser.
    pub fn new() -> Self {
        Self {}
    }

    /// Parses the 4-byte TS packet header.
    pub fn parse_header(&self, data: &[u8]) -> Result<TsHeader> {
        if data.len() < TS_HEADER_SIZE {
            return Err(TsioError::InvalidData("TS packet too short".into()));
        }
        if data[0] != 0x47 {
            return Err(TsioError::InvalidData("invalid sync byte".into()));
        }

        Ok(TsHeader {
            sync_byte: data[0],
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            transport_priority: (data[1] & 0x20) != 0,
            pid: (u16::from(data[1] & 0x1F) << 8) | u16::from(data[2]),
            scrambling_control: (data[3] >> 6) & 0x03,
            has_adaptation_field: (data[3] & 0x20) != 0,
            has_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Parses the adaptation field starting at byte 4, if the header
    /// announced one. A zero-length field (a single stuffing byte) parses to
    /// a default field.
    pub fn parse_adaptation_field(&self, data: &[u8]) -> Result<Option<AdaptationField>> {
        if (data[3] & 0x20) == 0 {
            return Ok(None);
        }

        let length = data[TS_HEADER_SIZE] as usize;
        if length == 0 {
            return Ok(Some(AdaptationField::default()));
        }
        if TS_HEADER_SIZE + 1 + length > data.len() {
            return Err(TsioError::InvalidData("adaptation field too long".into()));
        }

        let flags = data[TS_HEADER_SIZE + 1];
        let mut field = AdaptationField {
            length,
            discontinuity: (flags & 0x80) != 0,
            random_access: (flags & 0x40) != 0,
            es_priority: (flags & 0x20) != 0,
            ..Default::default()
        };

        let mut pos = TS_HEADER_SIZE + 2;

        if flags & 0x10 != 0 {
            // PCR
            if pos + 6 > data.len() {
                return Err(TsioError::InvalidData("PCR field truncated".into()));
            }
            let bytes: [u8; 6] = data[pos..pos + 6].try_into().unwrap();
            field.pcr = Some(Pcr::from_bytes(&bytes));
            pos += 6;
        }

        if flags & 0x08 != 0 {
            // OPCR
            if pos + 6 > data.len() {
                return Err(TsioError::InvalidData("OPCR field truncated".into()));
            }
            let bytes: [u8; 6] = data[pos..pos + 6].try_into().unwrap();
            field.opcr = Some(Pcr::from_bytes(&bytes));
            pos += 6;
        }

        if flags & 0x04 != 0 {
            // splice countdown
            if pos + 1 > data.len() {
                return Err(TsioError::InvalidData("splice countdown truncated".into()));
            }
            field.splice_countdown = Some(data[pos] as i8);
        }

        Ok(Some(field))
    }

    /// Splits a packet into header, adaptation field and payload bounds.
    ///
    /// When both an adaptation field and a payload are present, their lengths
    /// must sum to the 184 bytes following the header.
    pub fn split(&self, data: &[u8]) -> Result<SplitPacket> {
        let header = self.parse_header(data)?;
        let adaptation = self.parse_adaptation_field(data)?;

        let payload_offset = if header.has_payload {
            let offset = match &adaptation {
                Some(field) => TS_HEADER_SIZE + 1 + field.length,
                None => TS_HEADER_SIZE,
            };
            if offset > TS_PACKET_SIZE {
                return Err(TsioError::InvalidData(
                    "adaptation field overruns packet".into(),
                ));
            }
            Some(offset)
        } else {
            None
        };

        Ok(SplitPacket {
            header,
            adaptation,
            payload_offset,
        })
    }

    /// Convenience accessor: the extended PCR of a packet, if it carries one.
    pub fn extract_pcr(&self, data: &[u8]) -> Result<Option<Pcr>> {
        Ok(self.parse_adaptation_field(data)?.and_then(|f| f.pcr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn packet_with_pcr(pcr: Pcr) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        TsHeader {
            pid: 0x100,
            has_adaptation_field: true,
            has_payload: false,
            ..Default::default()
        }
        .write_to(&mut buf)
        .unwrap();
        buf.put_u8(183); // adaptation field fills the packet
        buf.put_u8(0x10); // PCR flag
        buf.put_slice(&pcr.to_bytes());
        while buf.len() < TS_PACKET_SIZE {
            buf.put_u8(0xFF);
        }
        buf.to_vec()
    }

    #[test]
    fn parses_header_fields() {
        let parser = TsPacketParser::new();
        let data = [0x47, 0x40, 0x00, 0x17];
        let header = parser.parse_header(&data).unwrap();
        assert!(header.payload_unit_start);
        assert_eq!(header.pid, 0);
        assert!(header.has_payload);
        assert_eq!(header.continuity_counter, 7);
    }

    #[test]
    fn rejects_bad_sync() {
        let parser = TsPacketParser::new();
        assert!(parser.parse_header(&[0x48, 0, 0, 0]).is_err());
    }

    #[test]
    fn extracts_pcr_bit_exactly() {
        let parser = TsPacketParser::new();
        let pcr = Pcr::from_parts(123_456_789, 123);
        let packet = packet_with_pcr(pcr);
        assert_eq!(parser.extract_pcr(&packet).unwrap(), Some(pcr));
    }

    #[test]
    fn split_accounts_for_adaptation_length() {
        let parser = TsPacketParser::new();
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        TsHeader {
            pid: 0x100,
            has_adaptation_field: true,
            has_payload: true,
            payload_unit_start: true,
            ..Default::default()
        }
        .write_to(&mut buf)
        .unwrap();
        buf.put_u8(7); // adaptation length
        buf.put_u8(0x00); // no flags
        buf.put_slice(&[0xFF; 6]); // stuffing
        while buf.len() < TS_PACKET_SIZE {
            buf.put_u8(0xAB);
        }

        let split = parser.split(&buf).unwrap();
        assert_eq!(split.payload_offset, Some(TS_HEADER_SIZE + 1 + 7));
        let adaptation = split.adaptation.unwrap();
        // adaptation (length byte + 7) plus payload must cover 184 bytes
        assert_eq!(1 + adaptation.length + (184 - 8), 184);
    }
}
