//! # MPEG-2 Program Stream
//!
//! Byte-level scanner for pack-framed streams: pack headers (MPEG-1 and
//! MPEG-2 layouts), system headers, the program stream map, PES packets and
//! the program end code. PES packets come out as the same
//! [`PesPacket`](crate::format::ts::PesPacket) type the TS demuxer yields,
//! so the elementary-stream layer does not care which container fed it.

use crate::error::{Result, TsioError};
use crate::format::ts::pes::{PesHeader, PesPacket, STREAM_ID_PSM};
use crate::format::PesSource;
use crate::utils::bits::BitReader;
use crate::utils::clock::Pcr;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Pack start code suffix (00 00 01 BA)
pub const PACK_START_CODE: u8 = 0xBA;
/// System header suffix (00 00 01 BB)
pub const SYSTEM_HEADER_CODE: u8 = 0xBB;
/// Program end suffix (00 00 01 B9)
pub const PROGRAM_END_CODE: u8 = 0xB9;

/// A parsed pack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// System clock reference (27 MHz extended for MPEG-2, ext 0 for MPEG-1)
    pub scr: Pcr,
    /// program_mux_rate in units of 50 bytes/second
    pub mux_rate: u32,
    /// True for the MPEG-1 pack layout
    pub mpeg1: bool,
    /// Byte offset of the pack start code
    pub offset: u64,
}

/// Scanner for Program Stream packs and the PES packets inside them.
pub struct PsReader<R> {
    source: R,
    buffer: BytesMut,
    buffer_offset: u64,
    eof: bool,
    /// Most recent pack header
    pub last_pack: Option<PackHeader>,
    /// System headers encountered (kept raw, identification only)
    pub system_headers_seen: u64,
    /// Program stream maps encountered
    pub psm_seen: u64,
    /// True once the program end code was read
    pub end_code_seen: bool,
    /// Garbage bytes skipped between syntactic elements
    pub bytes_skipped: u64,
}

impl<R: AsyncRead + Unpin + Send> PsReader<R> {
    /// Creates a reader over `source`.
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(8192),
            buffer_offset: 0,
            eof: false,
            last_pack: None,
            system_headers_seen: 0,
            psm_seen: 0,
            end_code_seen: false,
            bytes_skipped: 0,
        }
    }

    /// Byte offset of the next unconsumed byte.
    pub fn position(&self) -> u64 {
        self.buffer_offset
    }

    async fn fill(&mut self, want: usize) -> Result<()> {
        while self.buffer.len() < want && !self.eof {
            let mut chunk = [0u8; 4096];
            let n = self.source.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) -> Bytes {
        let taken = self.buffer.split_to(n).freeze();
        self.buffer_offset += n as u64;
        taken
    }

    /// Advances to the next `00 00 01` prefix, counting skipped bytes.
    /// Returns false at EOF.
    async fn find_start_code(&mut self) -> Result<bool> {
        loop {
            self.fill(4).await?;
            if self.buffer.len() < 4 {
                return Ok(false);
            }
            if let Some(at) = self
                .buffer
                .windows(3)
                .position(|w| w == [0x00, 0x00, 0x01])
            {
                if at > 0 {
                    self.bytes_skipped += at as u64;
                    self.consume(at);
                }
                self.fill(4).await?;
                return Ok(self.buffer.len() >= 4);
            }
            // Keep the last two bytes: they may start a split prefix.
            let keep = self.buffer.len().saturating_sub(2);
            self.bytes_skipped += keep as u64;
            self.consume(keep);
            if self.eof {
                return Ok(false);
            }
        }
    }

    fn parse_pack_header(data: &[u8], mpeg1: bool, offset: u64) -> Result<PackHeader> {
        let mut bits = BitReader::new(data);
        bits.skip_bits(if mpeg1 { 4 } else { 2 })?;
        let base_high = bits.read_bits(3)? as u64;
        bits.skip_bits(1)?;
        let base_mid = bits.read_bits(15)? as u64;
        bits.skip_bits(1)?;
        let base_low = bits.read_bits(15)? as u64;
        bits.skip_bits(1)?;
        let base = (base_high << 30) | (base_mid << 15) | base_low;

        let (ext, mux_rate) = if mpeg1 {
            bits.skip_bits(1)?;
            let rate = bits.read_bits(22)?;
            bits.skip_bits(1)?;
            (0u16, rate)
        } else {
            let ext = bits.read_bits(9)? as u16;
            bits.skip_bits(1)?;
            let rate = bits.read_bits(22)?;
            bits.skip_bits(2)?;
            (ext, rate)
        };

        Ok(PackHeader {
            scr: Pcr::from_parts(base, ext),
            mux_rate,
            mpeg1,
            offset,
        })
    }

    /// Reads forward to the next PES packet, handling pack headers, system
    /// headers and the end code along the way. Returns `None` at EOF or once
    /// the program end code has been seen.
    pub async fn next_pes(&mut self) -> Result<Option<PesPacket>> {
        loop {
            if !self.find_start_code().await? {
                return Ok(None);
            }
            let code = self.buffer[3];
            let offset = self.buffer_offset;

            match code {
                PACK_START_CODE => {
                    self.fill(5).await?;
                    if self.buffer.len() < 5 {
                        return Ok(None);
                    }
                    let mpeg1 = self.buffer[4] >> 4 == 0b0010;
                    let body_len = if mpeg1 { 8 } else { 10 };
                    self.fill(4 + body_len).await?;
                    if self.buffer.len() < 4 + body_len {
                        return Err(TsioError::Parser("pack header truncated".into()));
                    }
                    let pack =
                        Self::parse_pack_header(&self.buffer[4..4 + body_len], mpeg1, offset)?;
                    let mut total = 4 + body_len;
                    if !mpeg1 {
                        // pack_stuffing_length is the low 3 bits of the last
                        // header byte.
                        let stuffing = (self.buffer[4 + body_len - 1] & 0x07) as usize;
                        self.fill(total + stuffing).await?;
                        total += stuffing.min(self.buffer.len() - total);
                    }
                    self.consume(total);
                    self.last_pack = Some(pack);
                }
                PROGRAM_END_CODE => {
                    self.consume(4);
                    self.end_code_seen = true;
                    return Ok(None);
                }
                SYSTEM_HEADER_CODE => {
                    self.fill(6).await?;
                    if self.buffer.len() < 6 {
                        return Ok(None);
                    }
                    let length =
                        (usize::from(self.buffer[4]) << 8) | usize::from(self.buffer[5]);
                    self.fill(6 + length).await?;
                    let take = (6 + length).min(self.buffer.len());
                    self.consume(take);
                    self.system_headers_seen += 1;
                }
                stream_id if stream_id >= 0xBC => {
                    self.fill(6).await?;
                    if self.buffer.len() < 6 {
                        return Ok(None);
                    }
                    let length =
                        (usize::from(self.buffer[4]) << 8) | usize::from(self.buffer[5]);
                    if length == 0 {
                        // Unbounded PES is not legal in a Program Stream.
                        log::warn!(
                            "PES with zero length at offset {}; skipping start code",
                            offset
                        );
                        self.consume(4);
                        continue;
                    }
                    self.fill(6 + length).await?;
                    if self.buffer.len() < 6 + length {
                        log::warn!("PES truncated by EOF at offset {}", offset);
                        self.consume(self.buffer.len());
                        return Ok(None);
                    }
                    let data = self.consume(6 + length);
                    if stream_id == STREAM_ID_PSM {
                        self.psm_seen += 1;
                        continue;
                    }

                    let header = match PesHeader::parse(&data) {
                        Ok(header) => header,
                        Err(err) => {
                            // MPEG-1 system headers land here; deliver the
                            // payload without timestamp fields.
                            log::debug!(
                                "PES header at offset {} not MPEG-2 ({}); delivering raw",
                                offset,
                                err
                            );
                            PesHeader {
                                stream_id,
                                packet_length: length as u16,
                                header_len: 6,
                                ..Default::default()
                            }
                        }
                    };
                    let payload = data.slice(header.header_len.min(data.len())..);
                    return Ok(Some(PesPacket {
                        pid: 0,
                        header,
                        payload,
                        source_offset: offset,
                        source_index: 0,
                    }));
                }
                _ => {
                    // An elementary-stream start code at pack level: noise.
                    self.consume(4);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> PesSource for PsReader<R> {
    async fn next_pes_packet(&mut self) -> Result<Option<PesPacket>> {
        self.next_pes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::io::Cursor;

    fn mpeg2_pack_header(scr: Pcr, mux_rate: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x01, PACK_START_CODE]);
        let base = scr.base();
        let ext = u64::from(scr.ext());
        // '01' + scr fields + markers, bit-packed into 6 bytes
        let mut word: u64 = 0;
        word |= 0b01 << 46;
        word |= ((base >> 30) & 0x7) << 43;
        word |= 1 << 42;
        word |= ((base >> 15) & 0x7FFF) << 27;
        word |= 1 << 26;
        word |= (base & 0x7FFF) << 11;
        word |= 1 << 10;
        word |= ext << 1;
        word |= 1;
        buf.extend_from_slice(&word.to_be_bytes()[2..]);
        // mux_rate + two markers
        let rate_word: u32 = (mux_rate << 2) | 0b11;
        buf.extend_from_slice(&rate_word.to_be_bytes()[1..]);
        // reserved + pack_stuffing_length 0
        buf.push(0xF8);
        buf
    }

    fn bounded_pes(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut pes = BytesMut::new();
        let mut header = PesHeader {
            stream_id,
            pts,
            ..Default::default()
        };
        header.packet_length = (header.serialized_len() - 6 + payload.len()) as u16;
        header.write_to(&mut pes).unwrap();
        pes.put_slice(payload);
        pes.to_vec()
    }

    #[test]
    fn reads_packs_and_pes() {
        tokio_test::block_on(async {
            let mut data = Vec::new();
            data.extend_from_slice(&mpeg2_pack_header(Pcr::from_parts(90_000, 0), 5000));
            data.extend_from_slice(&bounded_pes(0xE0, Some(90_000), b"frame"));
            data.extend_from_slice(&bounded_pes(0xC0, None, b"audio"));
            data.extend_from_slice(&[0x00, 0x00, 0x01, PROGRAM_END_CODE]);

            let mut reader = PsReader::new(Cursor::new(data));
            let video = reader.next_pes().await.unwrap().unwrap();
            assert_eq!(video.stream_id(), 0xE0);
            assert_eq!(&video.payload[..], b"frame");
            assert_eq!(video.pts(), Some(90_000));

            let pack = reader.last_pack.unwrap();
            assert_eq!(pack.scr, Pcr::from_parts(90_000, 0));
            assert_eq!(pack.mux_rate, 5000);
            assert!(!pack.mpeg1);

            let audio = reader.next_pes().await.unwrap().unwrap();
            assert_eq!(audio.stream_id(), 0xC0);
            assert_eq!(&audio.payload[..], b"audio");

            assert!(reader.next_pes().await.unwrap().is_none());
            assert!(reader.end_code_seen);
        });
    }

    #[test]
    fn skips_garbage_between_elements() {
        tokio_test::block_on(async {
            let mut data = vec![0x13, 0x37];
            data.extend_from_slice(&bounded_pes(0xE0, None, b"x"));
            let mut reader = PsReader::new(Cursor::new(data));
            let pes = reader.next_pes().await.unwrap().unwrap();
            assert_eq!(&pes.payload[..], b"x");
            assert_eq!(reader.bytes_skipped, 2);
        });
    }

    #[test]
    fn system_header_is_counted_and_skipped() {
        tokio_test::block_on(async {
            let mut data = Vec::new();
            data.extend_from_slice(&[0x00, 0x00, 0x01, SYSTEM_HEADER_CODE, 0x00, 0x03, 1, 2, 3]);
            data.extend_from_slice(&bounded_pes(0xE0, None, b"y"));
            let mut reader = PsReader::new(Cursor::new(data));
            let pes = reader.next_pes().await.unwrap().unwrap();
            assert_eq!(&pes.payload[..], b"y");
            assert_eq!(reader.system_headers_seen, 1);
        });
    }
}
