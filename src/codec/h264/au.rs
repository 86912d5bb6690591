use super::parser::H264Parser;
use super::types::{H264AccessUnit, NalUnit, NalUnitType, SliceHeaderPrefix};
use crate::codec::es::StartCodeScanner;
use crate::error::Result;

/// Reads NAL units from a start-code-delimited byte stream.
///
/// The byte after each `00 00 01` prefix is the NAL header. Units with the
/// forbidden_zero_bit set or an unparsable slice header are reported as
/// warnings and skipped; the stream continues.
pub struct NalReader {
    scanner: StartCodeScanner,
    parser: H264Parser,
    /// NAL units dropped for a set forbidden bit or broken RBSP
    pub broken_nals: u64,
}

impl NalReader {
    /// Creates a reader over `scanner`.
    pub fn new(scanner: StartCodeScanner) -> Self {
        Self {
            scanner,
            parser: H264Parser::new(),
            broken_nals: 0,
        }
    }

    /// Access to the SPS/PPS dictionaries.
    pub fn parser(&self) -> &H264Parser {
        &self.parser
    }

    /// The next parseable NAL unit, or `None` at end of stream.
    pub async fn next_nal(&mut self) -> Result<Option<NalUnit>> {
        loop {
            let Some(unit) = self.scanner.next_unit().await? else {
                return Ok(None);
            };

            let header = unit.start_code;
            if header & 0x80 != 0 {
                self.broken_nals += 1;
                log::warn!("NAL at {:?} has forbidden_zero_bit set; skipped", unit.start);
                continue;
            }
            if unit.data.len() < 5 {
                self.broken_nals += 1;
                log::warn!("NAL at {:?} has an empty RBSP; skipped", unit.start);
                continue;
            }

            let nal_type = NalUnitType::from(header & 0x1F);
            let nal_ref_idc = (header >> 5) & 0x03;
            let rbsp = self.parser.unescape_rbsp(&unit.data[4..]);

            let mut slice = None;
            match nal_type {
                NalUnitType::Sps => {
                    if let Err(err) = self.parser.parse_sps(&rbsp) {
                        self.broken_nals += 1;
                        log::warn!("broken SPS at {:?}: {}; skipped", unit.start, err);
                        continue;
                    }
                }
                NalUnitType::Pps => {
                    if let Err(err) = self.parser.parse_pps(&rbsp) {
                        self.broken_nals += 1;
                        log::warn!("broken PPS at {:?}: {}; skipped", unit.start, err);
                        continue;
                    }
                }
                t if t.is_vcl() => {
                    let is_idr = t == NalUnitType::CodedSliceIdr;
                    match self.parser.parse_slice_prefix(&rbsp, is_idr) {
                        Ok(prefix) => slice = Some(prefix),
                        Err(err) => {
                            self.broken_nals += 1;
                            log::warn!("broken slice at {:?}: {}; skipped", unit.start, err);
                            continue;
                        }
                    }
                }
                _ => {}
            }

            return Ok(Some(NalUnit {
                nal_type,
                nal_ref_idc,
                unit,
                slice,
            }));
        }
    }
}

/// Aggregates NAL units into access units.
///
/// An access unit ends at the first of: an AU-delimiter NAL, a non-VCL NAL
/// after a VCL NAL, a VCL NAL whose slice-header prefix fields differ from
/// the previous VCL NAL, or end of stream.
pub struct H264AccessUnitBuilder {
    reader: NalReader,
    current: Vec<NalUnit>,
    current_prefix: Option<SliceHeaderPrefix>,
    pushed_back: Option<NalUnit>,
    /// Field access units dropped because no complement arrived
    pub orphan_fields: u64,
}

impl H264AccessUnitBuilder {
    /// Creates a builder over `reader`.
    pub fn new(reader: NalReader) -> Self {
        Self {
            reader,
            current: Vec::new(),
            current_prefix: None,
            pushed_back: None,
            orphan_fields: 0,
        }
    }

    /// NAL units dropped as broken so far.
    pub fn broken_nals(&self) -> u64 {
        self.reader.broken_nals
    }

    async fn next_nal(&mut self) -> Result<Option<NalUnit>> {
        if let Some(nal) = self.pushed_back.take() {
            return Ok(Some(nal));
        }
        self.reader.next_nal().await
    }

    fn finish_current(&mut self) -> Option<H264AccessUnit> {
        if self.current.is_empty() {
            return None;
        }
        let nal_units = std::mem::take(&mut self.current);
        self.current_prefix = None;

        let primary_slice = nal_units.iter().position(|n| n.is_vcl());
        let contains_idr = nal_units
            .iter()
            .any(|n| n.nal_type == NalUnitType::CodedSliceIdr);
        let contains_parameter_sets = nal_units
            .iter()
            .any(|n| matches!(n.nal_type, NalUnitType::Sps | NalUnitType::Pps));
        let prefix = primary_slice.and_then(|i| nal_units[i].slice);

        Some(H264AccessUnit {
            primary_slice,
            contains_idr,
            contains_parameter_sets,
            field_pic: prefix.map(|p| p.field_pic).unwrap_or(false),
            bottom_field: prefix.map(|p| p.bottom_field).unwrap_or(false),
            frame_num: prefix.map(|p| p.frame_num),
            was_merged: false,
            nal_units,
        })
    }

    /// The next access unit, or `None` at end of stream.
    pub async fn next_access_unit(&mut self) -> Result<Option<H264AccessUnit>> {
        loop {
            let Some(nal) = self.next_nal().await? else {
                return Ok(self.finish_current());
            };

            let has_vcl = self.current_prefix.is_some();

            if nal.nal_type == NalUnitType::AccessUnitDelimiter {
                if !self.current.is_empty() {
                    self.pushed_back = Some(nal);
                    return Ok(self.finish_current());
                }
                self.current.push(nal);
                continue;
            }

            if nal.is_vcl() {
                if let (Some(current), Some(incoming)) = (&self.current_prefix, &nal.slice) {
                    if current.differs_from(incoming) {
                        self.pushed_back = Some(nal);
                        return Ok(self.finish_current());
                    }
                }
                self.current_prefix = nal.slice;
                self.current.push(nal);
                continue;
            }

            // Non-VCL after the slices: the next picture is starting.
            if has_vcl {
                self.pushed_back = Some(nal);
                return Ok(self.finish_current());
            }
            self.current.push(nal);
        }
    }

    /// Like `next_access_unit`, but merges complementary field pairs (same
    /// frame_num, opposite bottom_field_flag) into one access unit.
    pub async fn next_frame(&mut self) -> Result<Option<H264AccessUnit>> {
        let Some(first) = self.next_access_unit().await? else {
            return Ok(None);
        };
        if !first.field_pic {
            return Ok(Some(first));
        }

        let mut first = first;
        let mut retried = false;
        loop {
            let Some(second) = self.next_access_unit().await? else {
                self.orphan_fields += 1;
                log::warn!(
                    "field access unit (frame_num {:?}) unpaired at EOF",
                    first.frame_num
                );
                return Ok(Some(first));
            };

            if second.field_pic
                && second.frame_num == first.frame_num
                && second.bottom_field != first.bottom_field
            {
                first.nal_units.extend(second.nal_units);
                first.was_merged = true;
                return Ok(Some(first));
            }

            self.orphan_fields += 1;
            if retried {
                return Err(crate::error::TsioError::FieldPairing {
                    first: first.frame_num.unwrap_or(0) as u16,
                    second: second.frame_num.unwrap_or(0) as u16,
                });
            }
            retried = true;
            log::warn!(
                "field access unit (frame_num {:?}) discarded; no complement",
                first.frame_num
            );
            if !second.field_pic {
                return Ok(Some(second));
            }
            first = second;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::es::tests::scanner_over;
    use crate::codec::h264::parser::tests::{
        baseline_sps_rbsp, interlaced_sps_rbsp, simple_pps_rbsp, slice_prefix_rbsp, BitWriter,
    };

    fn nal(header: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut unit = vec![0x00, 0x00, 0x01, header];
        // Escape would only matter for 00 00 0x sequences; the test RBSPs
        // avoid them.
        unit.extend_from_slice(rbsp);
        unit
    }

    fn field_slice_rbsp(frame_num: u32, bottom: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_golomb(0); // first_mb_in_slice
        w.put_golomb(7); // slice_type
        w.put_golomb(0); // pps_id
        w.put_bits(4, frame_num);
        w.put_bits(1, 1); // field_pic_flag
        w.put_bits(1, u32::from(bottom));
        w.put_bits(4, frame_num); // pic_order_cnt_lsb
        w.finish()
    }

    fn stream_prefix_progressive() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&nal(0x67, &baseline_sps_rbsp()));
        data.extend_from_slice(&nal(0x68, &simple_pps_rbsp()));
        data
    }

    fn stream_prefix_interlaced() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&nal(0x67, &interlaced_sps_rbsp()));
        data.extend_from_slice(&nal(0x68, &simple_pps_rbsp()));
        data
    }

    fn builder_over(data: Vec<u8>) -> H264AccessUnitBuilder {
        H264AccessUnitBuilder::new(NalReader::new(scanner_over(data)))
    }

    #[test]
    fn au_boundary_on_frame_num_change() {
        tokio_test::block_on(async {
            let mut data = stream_prefix_progressive();
            data.extend_from_slice(&nal(0x65, &slice_prefix_rbsp(0, 0, true)));
            data.extend_from_slice(&nal(0x41, &slice_prefix_rbsp(1, 2, false)));
            data.extend_from_slice(&nal(0x41, &slice_prefix_rbsp(2, 4, false)));

            let mut builder = builder_over(data);

            let first = builder.next_access_unit().await.unwrap().unwrap();
            // SPS + PPS + IDR slice
            assert_eq!(first.nal_units.len(), 3);
            assert!(first.contains_idr);
            assert!(first.contains_parameter_sets);
            assert_eq!(first.frame_num, Some(0));

            let second = builder.next_access_unit().await.unwrap().unwrap();
            assert_eq!(second.nal_units.len(), 1);
            assert_eq!(second.frame_num, Some(1));

            let third = builder.next_access_unit().await.unwrap().unwrap();
            assert_eq!(third.frame_num, Some(2));
            assert!(builder.next_access_unit().await.unwrap().is_none());
        });
    }

    #[test]
    fn au_delimiter_forces_boundary() {
        tokio_test::block_on(async {
            let mut data = stream_prefix_progressive();
            data.extend_from_slice(&nal(0x65, &slice_prefix_rbsp(0, 0, true)));
            data.extend_from_slice(&nal(0x09, &[0xF0])); // AU delimiter
            data.extend_from_slice(&nal(0x41, &slice_prefix_rbsp(0, 0, false)));

            let mut builder = builder_over(data);
            let first = builder.next_access_unit().await.unwrap().unwrap();
            assert!(first.contains_idr);
            let second = builder.next_access_unit().await.unwrap().unwrap();
            assert_eq!(
                second.nal_units[0].nal_type,
                NalUnitType::AccessUnitDelimiter
            );
            assert_eq!(second.nal_units.len(), 2);
        });
    }

    #[test]
    fn multi_slice_picture_stays_one_au() {
        tokio_test::block_on(async {
            let mut data = stream_prefix_progressive();
            // Two slices, same frame_num/poc: one picture.
            let mut slice2 = BitWriter::new();
            slice2.put_golomb(99); // first_mb_in_slice differs
            slice2.put_golomb(7);
            slice2.put_golomb(0);
            slice2.put_bits(4, 3);
            slice2.put_bits(4, 6);
            data.extend_from_slice(&nal(0x41, &slice_prefix_rbsp(3, 6, false)));
            data.extend_from_slice(&nal(0x41, &slice2.finish()));

            let mut builder = builder_over(data);
            let au = builder.next_access_unit().await.unwrap().unwrap();
            // SPS + PPS + two slices
            assert_eq!(au.nal_units.len(), 4);
        });
    }

    #[test]
    fn broken_nal_is_skipped_not_fatal() {
        tokio_test::block_on(async {
            let mut data = stream_prefix_progressive();
            data.extend_from_slice(&nal(0xE5, &slice_prefix_rbsp(0, 0, true))); // forbidden bit
            data.extend_from_slice(&nal(0x41, &slice_prefix_rbsp(1, 2, false)));

            let mut builder = builder_over(data);
            let au = builder.next_access_unit().await.unwrap().unwrap();
            assert_eq!(au.frame_num, Some(1));
            assert_eq!(builder.broken_nals(), 1);
        });
    }

    #[test]
    fn merges_field_pairs_into_frames() {
        tokio_test::block_on(async {
            let mut data = stream_prefix_interlaced();
            data.extend_from_slice(&nal(0x41, &field_slice_rbsp(4, false)));
            data.extend_from_slice(&nal(0x41, &field_slice_rbsp(4, true)));
            data.extend_from_slice(&nal(0x41, &field_slice_rbsp(5, false)));
            data.extend_from_slice(&nal(0x41, &field_slice_rbsp(5, true)));

            let mut builder = builder_over(data);
            let first = builder.next_frame().await.unwrap().unwrap();
            assert!(first.was_merged);
            assert_eq!(first.frame_num, Some(4));
            // SPS + PPS + top field + bottom field
            assert_eq!(first.nal_units.len(), 4);

            let second = builder.next_frame().await.unwrap().unwrap();
            assert!(second.was_merged);
            assert_eq!(second.frame_num, Some(5));
            assert!(builder.next_frame().await.unwrap().is_none());
        });
    }
}
