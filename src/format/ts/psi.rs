use super::types::*;
use crate::error::{Result, TsioError};
use crate::utils::crc::Crc32Mpeg2;
use std::collections::HashMap;

/// Per-PID reassembly state.
///
/// `Idle --pusi--> Collecting --length reached--> emit --> Idle`. A
/// continuation fragment while Idle is discarded; a new pusi while
/// Collecting discards the partial section.
#[derive(Debug, Default)]
enum PidState {
    #[default]
    Idle,
    Collecting {
        buffer: Vec<u8>,
        /// 3 + section_length once the section header is complete
        total_len: Option<usize>,
    },
}

/// Reassembles PSI sections scattered across TS packet payloads.
///
/// Fragments are copied into an owned buffer per PID; sections spanning any
/// number of packets complete when `section_length` bytes have accumulated
/// and their CRC checks out.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    states: HashMap<u16, PidState>,
    crc: Crc32Mpeg2,
    /// Sections discarded for a CRC mismatch
    pub crc_errors: u64,
    /// Continuation fragments with no section in progress
    pub stray_fragments: u64,
    /// Partial sections abandoned because a new section started
    pub abandoned_sections: u64,
}

impl SectionAssembler {
    /// Creates an assembler with no per-PID state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one TS payload fragment. Returns every complete, CRC-valid
    /// section that the fragment finished.
    ///
    /// With pusi set the fragment starts with a pointer_field: the tail of
    /// the previous section (if any) precedes the new section's first byte.
    pub fn push(&mut self, pid: u16, pusi: bool, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();
        if payload.is_empty() {
            return sections;
        }

        let state = self.states.entry(pid).or_default();

        if pusi {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                log::warn!("pid {:#06x}: pointer_field overruns payload", pid);
                *state = PidState::Idle;
                return sections;
            }

            // The bytes before the pointer target belong to the section in
            // progress.
            if let PidState::Collecting { buffer, total_len } = state {
                buffer.extend_from_slice(&payload[1..1 + pointer]);
                if let Some(total) = *total_len {
                    if buffer.len() >= total {
                        let section = buffer[..total].to_vec();
                        self.finish_section(pid, section, &mut sections);
                    } else {
                        self.abandoned_sections += 1;
                        log::warn!(
                            "pid {:#06x}: new section started {} bytes short of the previous one",
                            pid,
                            total - buffer.len()
                        );
                    }
                } else {
                    self.abandoned_sections += 1;
                }
            }

            let state = self.states.entry(pid).or_default();
            *state = PidState::Collecting {
                buffer: Vec::new(),
                total_len: None,
            };
            self.accumulate(pid, &payload[1 + pointer..], &mut sections);
        } else {
            let collecting = matches!(state, PidState::Collecting { .. });
            if collecting {
                self.accumulate(pid, payload, &mut sections);
            } else {
                self.stray_fragments += 1;
                log::warn!("pid {:#06x}: section continuation with no start", pid);
            }
        }

        sections
    }

    /// Appends bytes to the PID's buffer, emitting each section as its
    /// length is reached. Stuffing (a 0xFF table id) ends accumulation.
    fn accumulate(&mut self, pid: u16, bytes: &[u8], sections: &mut Vec<Vec<u8>>) {
        let mut pending = bytes.to_vec();
        loop {
            let state = self.states.entry(pid).or_default();
            let PidState::Collecting { buffer, total_len } = state else {
                return;
            };

            if buffer.is_empty() && pending.first() == Some(&0xFF) {
                *state = PidState::Idle;
                return;
            }

            buffer.extend_from_slice(&pending);
            pending.clear();

            if total_len.is_none() && buffer.len() >= 3 {
                let section_length = ((buffer[1] as usize & 0x0F) << 8) | buffer[2] as usize;
                *total_len = Some(3 + section_length);
            }

            match *total_len {
                Some(total) if buffer.len() >= total => {
                    let rest = buffer[total..].to_vec();
                    buffer.truncate(total);
                    let section = std::mem::take(buffer);
                    self.finish_section(pid, section, sections);
                    if rest.is_empty() || rest[0] == 0xFF {
                        return;
                    }
                    // More than one section in a single payload.
                    self.states.insert(
                        pid,
                        PidState::Collecting {
                            buffer: Vec::new(),
                            total_len: None,
                        },
                    );
                    pending = rest;
                }
                _ => return,
            }
        }
    }

    fn finish_section(&mut self, pid: u16, section: Vec<u8>, sections: &mut Vec<Vec<u8>>) {
        self.states.insert(pid, PidState::Idle);
        if self.crc.check_section(&section) {
            sections.push(section);
        } else {
            self.crc_errors += 1;
            log::warn!(
                "pid {:#06x}: section of {} bytes discarded (CRC mismatch)",
                pid,
                section.len()
            );
        }
    }

    /// Drops the reassembly state of one PID (e.g. after a discontinuity).
    pub fn reset_pid(&mut self, pid: u16) {
        self.states.insert(pid, PidState::Idle);
    }
}

/// Parses a complete PAT section (table id through CRC).
pub fn parse_pat_section(section: &[u8]) -> Result<Pat> {
    if section.len() < 12 {
        return Err(TsioError::Section {
            pid: PID_PAT,
            reason: "PAT section too short".into(),
        });
    }
    if section[0] != TABLE_ID_PAT {
        return Err(TsioError::Section {
            pid: PID_PAT,
            reason: format!("unexpected table id {:#04x}", section[0]),
        });
    }

    let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
    let total = 3 + section_length;
    if section.len() < total {
        return Err(TsioError::Section {
            pid: PID_PAT,
            reason: "PAT shorter than section_length".into(),
        });
    }

    let mut pat = Pat {
        transport_stream_id: (u16::from(section[3]) << 8) | u16::from(section[4]),
        version: (section[5] >> 1) & 0x1F,
        current_next: section[5] & 0x01 != 0,
        entries: Vec::new(),
    };

    let mut pos = 8;
    while pos + 4 <= total - 4 {
        let program_number = (u16::from(section[pos]) << 8) | u16::from(section[pos + 1]);
        let pid = (u16::from(section[pos + 2] & 0x1F) << 8) | u16::from(section[pos + 3]);
        pat.entries.push(PatEntry {
            program_number,
            pid,
        });
        pos += 4;
    }

    Ok(pat)
}

/// Parses a complete PMT section (table id through CRC).
pub fn parse_pmt_section(section: &[u8]) -> Result<Pmt> {
    if section.len() < 16 {
        return Err(TsioError::Parser("PMT section too short".into()));
    }
    if section[0] != TABLE_ID_PMT {
        return Err(TsioError::Parser(format!(
            "unexpected PMT table id {:#04x}",
            section[0]
        )));
    }

    let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
    let total = 3 + section_length;
    if section.len() < total {
        return Err(TsioError::Parser("PMT shorter than section_length".into()));
    }

    let mut pmt = Pmt {
        program_number: (u16::from(section[3]) << 8) | u16::from(section[4]),
        version: (section[5] >> 1) & 0x1F,
        current_next: section[5] & 0x01 != 0,
        pcr_pid: (u16::from(section[8] & 0x1F) << 8) | u16::from(section[9]),
        program_descriptors: Vec::new(),
        streams: Vec::new(),
    };

    let program_info_length = ((section[10] as usize & 0x0F) << 8) | section[11] as usize;
    let mut pos = 12;
    if pos + program_info_length > total - 4 {
        return Err(TsioError::Parser(
            "program descriptors overrun PMT section".into(),
        ));
    }
    pmt.program_descriptors = parse_descriptors(&section[pos..pos + program_info_length])?;
    pos += program_info_length;

    while pos + 5 <= total - 4 {
        let stream_type = section[pos];
        let elementary_pid = (u16::from(section[pos + 1] & 0x1F) << 8) | u16::from(section[pos + 2]);
        let es_info_length = ((section[pos + 3] as usize & 0x0F) << 8) | section[pos + 4] as usize;
        pos += 5;
        if pos + es_info_length > total - 4 {
            return Err(TsioError::Parser(
                "stream descriptors overrun PMT section".into(),
            ));
        }
        let descriptors = parse_descriptors(&section[pos..pos + es_info_length])?;
        pos += es_info_length;
        pmt.streams.push(StreamEntry {
            stream_type,
            elementary_pid,
            descriptors,
        });
    }

    Ok(pmt)
}

fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let length = data[pos + 1] as usize;
        pos += 2;
        if pos + length > data.len() {
            return Err(TsioError::Parser("descriptor overruns its loop".into()));
        }
        descriptors.push(Descriptor {
            tag,
            data: data[pos..pos + length].to_vec(),
        });
        pos += length;
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    fn sample_pat() -> Pat {
        Pat {
            transport_stream_id: 1,
            version: 3,
            current_next: true,
            entries: vec![PatEntry {
                program_number: 1,
                pid: 0x1000,
            }],
        }
    }

    fn sample_pmt() -> Pmt {
        Pmt {
            program_number: 1,
            version: 2,
            current_next: true,
            pcr_pid: 0x100,
            program_descriptors: Vec::new(),
            streams: vec![
                StreamEntry {
                    stream_type: STREAM_TYPE_H262,
                    elementary_pid: 0x100,
                    descriptors: Vec::new(),
                },
                StreamEntry {
                    stream_type: STREAM_TYPE_MPEG2_AUDIO,
                    elementary_pid: 0x101,
                    descriptors: vec![Descriptor {
                        tag: 0x0A,
                        data: b"eng\0".to_vec(),
                    }],
                },
            ],
        }
    }

    #[test]
    fn pat_section_round_trip() {
        let pat = sample_pat();
        let mut buf = BytesMut::new();
        pat.write_section(&mut buf).unwrap();
        let parsed = parse_pat_section(&buf).unwrap();
        assert_eq!(parsed, pat);

        // Re-serializing the parse yields the original octets.
        let mut again = BytesMut::new();
        parsed.write_section(&mut again).unwrap();
        assert_eq!(&again[..], &buf[..]);
    }

    #[test]
    fn pmt_section_round_trip() {
        let pmt = sample_pmt();
        let mut buf = BytesMut::new();
        pmt.write_section(&mut buf).unwrap();
        let parsed = parse_pmt_section(&buf).unwrap();
        assert_eq!(parsed, pmt);

        let mut again = BytesMut::new();
        parsed.write_section(&mut again).unwrap();
        assert_eq!(&again[..], &buf[..]);
    }

    #[test]
    fn assembles_section_split_across_fragments() {
        let pat = sample_pat();
        let mut section = BytesMut::new();
        pat.write_section(&mut section).unwrap();

        let mut assembler = SectionAssembler::new();
        let mut first = vec![0u8]; // pointer_field
        first.extend_from_slice(&section[..7]);
        assert!(assembler.push(PID_PAT, true, &first).is_empty());
        let done = assembler.push(PID_PAT, false, &section[7..]);
        assert_eq!(done.len(), 1);
        assert_eq!(parse_pat_section(&done[0]).unwrap(), pat);
    }

    #[test]
    fn corrupt_crc_is_discarded_and_counted() {
        let pat = sample_pat();
        let mut section = BytesMut::new();
        pat.write_section(&mut section).unwrap();
        let last = section.len() - 1;
        section[last] ^= 0xFF;

        let mut assembler = SectionAssembler::new();
        let mut fragment = vec![0u8];
        fragment.extend_from_slice(&section);
        assert!(assembler.push(PID_PAT, true, &fragment).is_empty());
        assert_eq!(assembler.crc_errors, 1);
    }

    #[test]
    fn stray_continuation_is_discarded() {
        let mut assembler = SectionAssembler::new();
        assert!(assembler.push(PID_PAT, false, &[1, 2, 3]).is_empty());
        assert_eq!(assembler.stray_fragments, 1);
    }

    #[test]
    fn new_start_abandons_partial() {
        let pat = sample_pat();
        let mut section = BytesMut::new();
        pat.write_section(&mut section).unwrap();

        let mut assembler = SectionAssembler::new();
        let mut partial = vec![0u8];
        partial.extend_from_slice(&section[..5]);
        assert!(assembler.push(PID_PAT, true, &partial).is_empty());

        let mut fresh = vec![0u8];
        fresh.extend_from_slice(&section);
        let done = assembler.push(PID_PAT, true, &fresh);
        assert_eq!(done.len(), 1);
        assert_eq!(assembler.abandoned_sections, 1);
    }

    #[test]
    fn pusi_pointer_completes_previous_section() {
        let pat = sample_pat();
        let mut section = BytesMut::new();
        pat.write_section(&mut section).unwrap();

        let split = section.len() - 3;
        let mut assembler = SectionAssembler::new();
        let mut first = vec![0u8];
        first.extend_from_slice(&section[..split]);
        assert!(assembler.push(PID_PAT, true, &first).is_empty());

        // Next packet: pointer_field 3, the section tail, then a new section.
        let mut second = vec![3u8];
        second.extend_from_slice(&section[split..]);
        second.extend_from_slice(&section);
        let done = assembler.push(PID_PAT, true, &second);
        assert_eq!(done.len(), 2);
    }
}
