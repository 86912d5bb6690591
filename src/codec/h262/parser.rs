use super::types::*;
use crate::codec::es::{EsUnit, StartCodeScanner};
use crate::error::{Result, TsioError};
use crate::utils::bits::BitReader;

/// Signature of DTG1 (AFD) user data.
const DTG1: [u8; 4] = [0x44, 0x54, 0x47, 0x31];

/// extension_start_code_identifier of the sequence extension.
const EXT_ID_SEQUENCE: u32 = 1;
/// extension_start_code_identifier of the picture coding extension.
const EXT_ID_PICTURE_CODING: u32 = 8;

/// Aggregates ES units into H.262 pictures and sequence headers.
///
/// `next_picture` yields items at picture granularity; `next_frame`
/// additionally merges complementary field pairs into a single picture.
pub struct H262PictureBuilder {
    scanner: StartCodeScanner,
    pushed_back: Option<EsUnit>,
    /// GOP headers awaiting the picture that follows them
    held_units: Vec<EsUnit>,
    /// Last AFD seen in user data; sticky across pictures
    last_afd: Option<u8>,
    /// Field pictures dropped because no complement arrived
    pub orphan_fields: u64,
    /// Units skipped because no picture context was open
    pub stray_units: u64,
}

impl H262PictureBuilder {
    /// Creates a builder over `scanner`.
    pub fn new(scanner: StartCodeScanner) -> Self {
        Self {
            scanner,
            pushed_back: None,
            held_units: Vec::new(),
            last_afd: None,
            orphan_fields: 0,
            stray_units: 0,
        }
    }

    async fn next_unit(&mut self) -> Result<Option<EsUnit>> {
        if let Some(unit) = self.pushed_back.take() {
            return Ok(Some(unit));
        }
        self.scanner.next_unit().await
    }

    /// Parses temporal_reference and picture_coding_type from a picture
    /// header unit.
    fn parse_picture_header(unit: &EsUnit) -> Result<(u16, PictureCodingType)> {
        if unit.data.len() < 6 {
            return Err(TsioError::Parser("picture header truncated".into()));
        }
        let mut bits = BitReader::new(&unit.data[4..]);
        let temporal_reference = bits.read_bits(10)? as u16;
        let coding_type = PictureCodingType::from(bits.read_bits(3)? as u8);
        Ok((temporal_reference, coding_type))
    }

    /// Extracts picture_structure and progressive_frame from a picture
    /// coding extension unit, if it is one.
    fn parse_picture_coding_extension(unit: &EsUnit) -> Option<(PictureStructure, bool)> {
        if unit.data.len() < 9 {
            return None;
        }
        let mut bits = BitReader::new(&unit.data[4..]);
        if bits.read_bits(4).ok()? != EXT_ID_PICTURE_CODING {
            return None;
        }
        bits.skip_bits(16).ok()?; // f_codes
        bits.skip_bits(2).ok()?; // intra_dc_precision
        let structure = match bits.read_bits(2).ok()? {
            0b01 => PictureStructure::TopField,
            0b10 => PictureStructure::BottomField,
            _ => PictureStructure::Frame,
        };
        // top_field_first .. chroma_420_type
        bits.skip_bits(8).ok()?;
        let progressive = bits.read_bits(1).ok()? == 1;
        Some((structure, progressive))
    }

    /// progressive_sequence from a sequence extension unit, if it is one.
    fn parse_sequence_extension(unit: &EsUnit) -> Option<bool> {
        if unit.data.len() < 6 {
            return None;
        }
        let mut bits = BitReader::new(&unit.data[4..]);
        if bits.read_bits(4).ok()? != EXT_ID_SEQUENCE {
            return None;
        }
        bits.skip_bits(8).ok()?; // profile_and_level_indication
        Some(bits.read_bits(1).ok()? == 1)
    }

    /// The 4-bit AFD of a DTG1 user data unit, if present.
    fn parse_afd(unit: &EsUnit) -> Option<u8> {
        let data = &unit.data;
        if data.len() < 10 || data[4..8] != DTG1 {
            return None;
        }
        if data[8] & 0x40 == 0 {
            return None;
        }
        Some(data[9] & 0x0F)
    }

    /// True for codes that end a picture or header grouping.
    fn is_item_boundary(code: u8) -> bool {
        matches!(
            code,
            PICTURE_START_CODE | SEQUENCE_HEADER_CODE | SEQUENCE_END_CODE | GROUP_START_CODE
        )
    }

    /// The next picture, sequence header or sequence end, or `None` at EOF.
    pub async fn next_picture(&mut self) -> Result<Option<H262Item>> {
        loop {
            let Some(unit) = self.next_unit().await? else {
                if !self.held_units.is_empty() {
                    log::warn!(
                        "{} group/header units at EOF with no picture",
                        self.held_units.len()
                    );
                    self.held_units.clear();
                }
                return Ok(None);
            };

            match unit.start_code {
                PICTURE_START_CODE => return self.collect_picture(unit).await.map(Some),
                SEQUENCE_HEADER_CODE => return self.collect_sequence_header(unit).await.map(Some),
                SEQUENCE_END_CODE => return Ok(Some(H262Item::SequenceEnd(unit))),
                GROUP_START_CODE => {
                    // A GOP header belongs with the picture that follows.
                    self.held_units.push(unit);
                }
                code => {
                    self.stray_units += 1;
                    log::warn!(
                        "skipping unit {:#04x} at {:?} outside any picture",
                        code,
                        unit.start
                    );
                }
            }
        }
    }

    async fn collect_picture(&mut self, header_unit: EsUnit) -> Result<H262Item> {
        let (temporal_reference, coding_type) = Self::parse_picture_header(&header_unit)?;
        let mut units = std::mem::take(&mut self.held_units);
        units.push(header_unit);

        let mut structure = PictureStructure::Frame;
        let mut progressive = false;

        loop {
            let Some(unit) = self.next_unit().await? else {
                break;
            };
            if Self::is_item_boundary(unit.start_code) {
                self.pushed_back = Some(unit);
                break;
            }
            match unit.start_code {
                EXTENSION_START_CODE => {
                    if let Some((s, p)) = Self::parse_picture_coding_extension(&unit) {
                        structure = s;
                        progressive = p;
                    }
                }
                USER_DATA_START_CODE => {
                    if let Some(afd) = Self::parse_afd(&unit) {
                        self.last_afd = Some(afd);
                    }
                }
                _ => {}
            }
            units.push(unit);
        }

        Ok(H262Item::Picture(H262Picture {
            coding_type,
            temporal_reference,
            structure,
            progressive,
            afd: self.last_afd,
            was_merged: false,
            units,
        }))
    }

    async fn collect_sequence_header(&mut self, header_unit: EsUnit) -> Result<H262Item> {
        if header_unit.data.len() < 8 {
            return Err(TsioError::Parser("sequence header truncated".into()));
        }
        let mut bits = BitReader::new(&header_unit.data[4..]);
        let horizontal_size = bits.read_bits(12)? as u16;
        let vertical_size = bits.read_bits(12)? as u16;
        let aspect_ratio_info = bits.read_bits(4)? as u8;

        let mut units = vec![header_unit];
        let mut progressive_sequence = false;

        // Attach extension and user data units; anything else ends the item.
        loop {
            let Some(unit) = self.next_unit().await? else {
                break;
            };
            match unit.start_code {
                EXTENSION_START_CODE => {
                    if let Some(progressive) = Self::parse_sequence_extension(&unit) {
                        progressive_sequence = progressive;
                    }
                    units.push(unit);
                }
                USER_DATA_START_CODE => {
                    if let Some(afd) = Self::parse_afd(&unit) {
                        self.last_afd = Some(afd);
                    }
                    units.push(unit);
                }
                _ => {
                    self.pushed_back = Some(unit);
                    break;
                }
            }
        }

        Ok(H262Item::SequenceHeader(H262SequenceHeader {
            aspect_ratio_info,
            progressive_sequence,
            horizontal_size,
            vertical_size,
            units,
        }))
    }

    /// Like `next_picture`, but merges a complementary field pair into one
    /// picture with `was_merged` set.
    ///
    /// On a temporal_reference mismatch the first field is discarded and the
    /// second takes its place, once; a second mismatch is a
    /// [`TsioError::FieldPairing`].
    pub async fn next_frame(&mut self) -> Result<Option<H262Item>> {
        let Some(item) = self.next_picture().await? else {
            return Ok(None);
        };
        let H262Item::Picture(first) = item else {
            return Ok(Some(item));
        };
        if !first.structure.is_field() {
            return Ok(Some(H262Item::Picture(first)));
        }

        let mut first = first;
        let mut retried = false;
        loop {
            let Some(next) = self.next_picture().await? else {
                self.orphan_fields += 1;
                log::warn!(
                    "field picture (temporal_reference {}) unpaired at EOF",
                    first.temporal_reference
                );
                return Ok(Some(H262Item::Picture(first)));
            };

            let H262Item::Picture(second) = next else {
                self.orphan_fields += 1;
                log::warn!(
                    "field picture (temporal_reference {}) followed by non-picture; dropped",
                    first.temporal_reference
                );
                return Ok(Some(next));
            };

            if first.structure.complement() == Some(second.structure)
                && second.temporal_reference == first.temporal_reference
            {
                first.units.extend(second.units);
                first.was_merged = true;
                first.progressive = false;
                return Ok(Some(H262Item::Picture(first)));
            }

            // Mismatched pair: drop the first field and retry once with the
            // second picture as the new first field.
            self.orphan_fields += 1;
            if retried {
                return Err(TsioError::FieldPairing {
                    first: first.temporal_reference,
                    second: second.temporal_reference,
                });
            }
            retried = true;
            log::warn!(
                "field with temporal_reference {} discarded ({} followed)",
                first.temporal_reference,
                second.temporal_reference
            );
            if !second.structure.is_field() {
                return Ok(Some(H262Item::Picture(second)));
            }
            first = second;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::es::tests::scanner_over;

    fn picture_header(temporal_reference: u16, coding_type: u8) -> Vec<u8> {
        // 10 bits TR, 3 bits type, 16 bits vbv_delay, padding
        let word: u32 = (u32::from(temporal_reference) << 22)
            | (u32::from(coding_type) << 19)
            | (0xFFFF << 3);
        let mut unit = vec![0x00, 0x00, 0x01, 0x00];
        unit.extend_from_slice(&word.to_be_bytes());
        unit
    }

    fn picture_coding_extension(structure: u8, progressive: bool) -> Vec<u8> {
        // ext id 8, f_codes 0xFFFF, intra_dc 0, structure, 8 flag bits,
        // progressive_frame
        // Layout: [ext 4][f_codes 16][dc 2][structure 2][flags 8] = 32 bits,
        // progressive_frame is the first bit of the next byte.
        let mut bits: u32 = 0;
        bits |= 8 << 28;
        bits |= 0xFFFF << 12;
        bits |= u32::from(structure) << 8;
        let mut unit = vec![0x00, 0x00, 0x01, 0xB5];
        unit.extend_from_slice(&bits.to_be_bytes());
        unit.push(if progressive { 0x80 } else { 0x00 });
        unit
    }

    fn slice(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut unit = vec![0x00, 0x00, 0x01, code];
        unit.extend_from_slice(payload);
        unit
    }

    fn sequence_header(aspect: u8) -> Vec<u8> {
        // 12 bits h=720, 12 bits v=576, 4 bits aspect, 4 bits frame_rate
        let word: u32 =
            (720u32 << 20) | (576u32 << 8) | (u32::from(aspect) << 4) | 0x3;
        let mut unit = vec![0x00, 0x00, 0x01, 0xB3];
        unit.extend_from_slice(&word.to_be_bytes());
        unit.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        unit
    }

    fn field_picture(temporal_reference: u16, structure: u8) -> Vec<u8> {
        let mut data = picture_header(temporal_reference, 1);
        data.extend_from_slice(&picture_coding_extension(structure, false));
        data.extend_from_slice(&slice(0x01, &[0xAA; 4]));
        data
    }

    #[test]
    fn picture_collects_extension_and_slices() {
        tokio_test::block_on(async {
            let mut data = picture_header(7, 2);
            data.extend_from_slice(&picture_coding_extension(0b11, true));
            data.extend_from_slice(&slice(0x01, &[1, 2, 3]));
            data.extend_from_slice(&slice(0x02, &[4, 5]));
            data.extend_from_slice(&picture_header(8, 3));
            data.extend_from_slice(&slice(0x01, &[6]));

            let mut builder = H262PictureBuilder::new(scanner_over(data));

            let H262Item::Picture(first) = builder.next_picture().await.unwrap().unwrap() else {
                panic!("expected picture");
            };
            assert_eq!(first.temporal_reference, 7);
            assert_eq!(first.coding_type, PictureCodingType::P);
            assert_eq!(first.structure, PictureStructure::Frame);
            assert!(first.progressive);
            assert_eq!(first.units.len(), 4);

            let H262Item::Picture(second) = builder.next_picture().await.unwrap().unwrap() else {
                panic!("expected picture");
            };
            assert_eq!(second.temporal_reference, 8);
            assert_eq!(second.coding_type, PictureCodingType::B);
            assert!(builder.next_picture().await.unwrap().is_none());
        });
    }

    #[test]
    fn sequence_header_yields_aspect_ratio() {
        tokio_test::block_on(async {
            let mut data = sequence_header(0x3);
            data.extend_from_slice(&picture_header(0, 1));
            data.extend_from_slice(&slice(0x01, &[0]));

            let mut builder = H262PictureBuilder::new(scanner_over(data));
            let H262Item::SequenceHeader(header) =
                builder.next_picture().await.unwrap().unwrap()
            else {
                panic!("expected sequence header");
            };
            assert_eq!(header.aspect_ratio_info, 0x3);
            assert_eq!(header.horizontal_size, 720);
            assert_eq!(header.vertical_size, 576);
        });
    }

    #[test]
    fn afd_is_sticky_across_pictures() {
        tokio_test::block_on(async {
            let mut user_data = vec![0x00, 0x00, 0x01, 0xB2];
            user_data.extend_from_slice(&DTG1);
            user_data.push(0x41); // active_format_flag set
            user_data.push(0xF0 | 0x09); // AFD 9

            let mut data = picture_header(1, 1);
            data.extend_from_slice(&user_data);
            data.extend_from_slice(&slice(0x01, &[0]));
            data.extend_from_slice(&picture_header(2, 2));
            data.extend_from_slice(&slice(0x01, &[0]));

            let mut builder = H262PictureBuilder::new(scanner_over(data));
            let H262Item::Picture(first) = builder.next_picture().await.unwrap().unwrap() else {
                panic!()
            };
            assert_eq!(first.afd, Some(9));
            let H262Item::Picture(second) = builder.next_picture().await.unwrap().unwrap() else {
                panic!()
            };
            // No user data in the second picture: AFD carries over.
            assert_eq!(second.afd, Some(9));
        });
    }

    #[test]
    fn merges_matching_field_pairs() {
        tokio_test::block_on(async {
            let mut data = field_picture(7, 0b01);
            data.extend_from_slice(&field_picture(7, 0b10));
            data.extend_from_slice(&field_picture(8, 0b01));
            data.extend_from_slice(&field_picture(8, 0b10));

            let mut builder = H262PictureBuilder::new(scanner_over(data));

            for expected_tr in [7u16, 8] {
                let H262Item::Picture(frame) = builder.next_frame().await.unwrap().unwrap()
                else {
                    panic!("expected picture");
                };
                assert!(frame.was_merged);
                assert_eq!(frame.temporal_reference, expected_tr);
                // picture header + extension + slice, twice
                assert_eq!(frame.units.len(), 6);
            }
            assert!(builder.next_frame().await.unwrap().is_none());
        });
    }

    #[test]
    fn mismatched_fields_retry_then_error() {
        tokio_test::block_on(async {
            // Three fields with three different temporal references.
            let mut data = field_picture(1, 0b01);
            data.extend_from_slice(&field_picture(2, 0b10));
            data.extend_from_slice(&field_picture(3, 0b01));

            let mut builder = H262PictureBuilder::new(scanner_over(data));
            let result = builder.next_frame().await;
            assert!(matches!(
                result,
                Err(TsioError::FieldPairing {
                    first: 2,
                    second: 3
                })
            ));
        });
    }

    #[test]
    fn same_parity_fields_do_not_merge() {
        tokio_test::block_on(async {
            // Two top fields with the same temporal reference.
            let mut data = field_picture(5, 0b01);
            data.extend_from_slice(&field_picture(5, 0b01));

            let mut builder = H262PictureBuilder::new(scanner_over(data));
            let H262Item::Picture(picture) = builder.next_frame().await.unwrap().unwrap() else {
                panic!("expected picture");
            };
            // The first field is discarded; the second comes back unpaired
            // at EOF.
            assert!(!picture.was_merged);
            assert_eq!(picture.temporal_reference, 5);
            assert_eq!(builder.orphan_fields, 2);
        });
    }

    #[test]
    fn sequence_end_is_a_singleton() {
        tokio_test::block_on(async {
            let data = vec![0x00, 0x00, 0x01, 0xB7];
            let mut builder = H262PictureBuilder::new(scanner_over(data));
            assert!(matches!(
                builder.next_picture().await.unwrap(),
                Some(H262Item::SequenceEnd(_))
            ));
        });
    }
}
