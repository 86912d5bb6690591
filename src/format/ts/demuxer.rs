use super::muxer::TsMuxer;
use super::parser::TsPacketParser;
use super::pes::{PesHeader, PesPacket};
use super::psi::{parse_pat_section, parse_pmt_section, SectionAssembler};
use super::reader::TsReader;
use super::types::*;
use crate::error::Result;
use crate::format::PesSource;
use crate::utils::clock::Pcr;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Configuration for [`TsDemuxer`].
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// Program to select; `None` takes the first program the PAT lists
    pub program_number: Option<u16>,
    /// Ignore the program's audio stream entirely
    pub video_only: bool,
    /// In mirror mode, re-emit PAT/PMT every this many PES packets
    pub mirror_psi_interval: u32,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            program_number: None,
            video_only: false,
            mirror_psi_interval: 10,
        }
    }
}

/// One observed Program Clock Reference and where it was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrObservation {
    /// The extended 42-bit PCR
    pub pcr: Pcr,
    /// Byte offset in the source of the carrying packet
    pub byte_offset: u64,
    /// Index of the carrying packet
    pub packet_index: u64,
}

/// A shared, lock-cheap handle to the current PMT snapshot.
///
/// The demuxer replaces the whole `Arc` when a newer table parses; readers
/// clone the `Arc` and never hold the lock while using it.
#[derive(Debug, Default, Clone)]
pub struct PmtHandle {
    inner: Arc<RwLock<Option<Arc<Pmt>>>>,
}

impl PmtHandle {
    /// The current snapshot, if a PMT has been seen.
    pub fn snapshot(&self) -> Option<Arc<Pmt>> {
        self.inner.read().clone()
    }

    fn replace(&self, pmt: Arc<Pmt>) {
        *self.inner.write() = Some(pmt);
    }
}

/// In-progress reassembly of one PES packet.
struct PesAccumulator {
    data: BytesMut,
    source_offset: u64,
    source_index: u64,
    /// 6 + PES_packet_length for bounded packets
    expected_total: Option<usize>,
}

impl PesAccumulator {
    fn new(offset: u64, index: u64) -> Self {
        Self {
            data: BytesMut::new(),
            source_offset: offset,
            source_index: index,
            expected_total: None,
        }
    }

    fn push(&mut self, payload: &[u8]) {
        self.data.extend_from_slice(payload);
        if self.expected_total.is_none() && self.data.len() >= 6 {
            let length = (usize::from(self.data[4]) << 8) | usize::from(self.data[5]);
            if length != 0 {
                self.expected_total = Some(6 + length);
            }
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.expected_total, Some(total) if self.data.len() >= total)
    }

    fn finish(self, pid: u16) -> Result<PesPacket> {
        let mut data: Bytes = self.data.freeze();
        if let Some(total) = self.expected_total {
            // Bounded packets: anything past PES_packet_length is stuffing.
            if data.len() > total {
                data = data.slice(..total);
            }
        }
        let header = PesHeader::parse(&data)?;
        let payload = data.slice(header.header_len.min(data.len())..);
        Ok(PesPacket {
            pid,
            header,
            payload,
            source_offset: self.source_offset,
            source_index: self.source_index,
        })
    }
}

type MirrorWriter = TsMuxer<Box<dyn AsyncWrite + Unpin + Send>>;

/// Demultiplexer: drives a [`TsReader`], reassembles PSI, selects one
/// program and yields that program's PES packets.
pub struct TsDemuxer<R: AsyncRead + Unpin + Send> {
    reader: TsReader<R>,
    parser: TsPacketParser,
    assembler: SectionAssembler,
    config: DemuxConfig,
    pat: Option<Arc<Pat>>,
    pmt_pid: Option<u16>,
    pmt: PmtHandle,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    pcr_pid: Option<u16>,
    accumulators: HashMap<u16, PesAccumulator>,
    last_pcr: Option<PcrObservation>,
    /// PES packets whose header failed to parse
    pub bad_pes_packets: u64,
    mirror: Option<MirrorWriter>,
    mirrored_since_psi: u32,
}

impl<R: AsyncRead + Unpin + Send> TsDemuxer<R> {
    /// Creates a demuxer over `reader` with the given configuration.
    pub fn new(reader: TsReader<R>, config: DemuxConfig) -> Self {
        Self {
            reader,
            parser: TsPacketParser::new(),
            assembler: SectionAssembler::new(),
            config,
            pat: None,
            pmt_pid: None,
            pmt: PmtHandle::default(),
            video_pid: None,
            audio_pid: None,
            pcr_pid: None,
            accumulators: HashMap::new(),
            last_pcr: None,
            bad_pes_packets: 0,
            mirror: None,
            mirrored_since_psi: 0,
        }
    }

    /// Attaches a mirror writer: every PES packet this demuxer yields is also
    /// re-emitted as TS, with PAT/PMT repeated periodically.
    pub fn with_mirror(mut self, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        self.mirror = Some(TsMuxer::new(writer));
        self
    }

    /// A shareable handle to the selected program's PMT snapshots.
    pub fn pmt_handle(&self) -> PmtHandle {
        self.pmt.clone()
    }

    /// The PAT snapshot, once one has parsed.
    pub fn pat(&self) -> Option<Arc<Pat>> {
        self.pat.clone()
    }

    /// PID selected for video, once the PMT has been seen.
    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    /// PID selected for audio (`None` in video-only mode).
    pub fn audio_pid(&self) -> Option<u16> {
        self.audio_pid
    }

    /// The most recent PCR observation from the program's PCR PID.
    pub fn last_pcr(&self) -> Option<PcrObservation> {
        self.last_pcr
    }

    /// Counters from the PSI assembler (CRC errors etc.).
    pub fn section_errors(&self) -> u64 {
        self.assembler.crc_errors
    }

    fn handle_pat_section(&mut self, section: &[u8]) {
        let pat = match parse_pat_section(section) {
            Ok(pat) => pat,
            Err(err) => {
                log::warn!("discarding PAT: {}", err);
                return;
            }
        };
        if !pat.current_next {
            return;
        }

        let entry = match self.config.program_number {
            Some(number) => pat.entries.iter().find(|e| e.program_number == number),
            None => pat.first_program(),
        };
        if let Some(entry) = entry {
            if self.pmt_pid != Some(entry.pid) {
                log::debug!(
                    "program {} mapped to PMT pid {:#06x}",
                    entry.program_number,
                    entry.pid
                );
            }
            self.pmt_pid = Some(entry.pid);
        } else if let Some(number) = self.config.program_number {
            log::warn!("PAT does not list requested program {}", number);
        }
        self.pat = Some(Arc::new(pat));
    }

    fn handle_pmt_section(&mut self, section: &[u8]) {
        let pmt = match parse_pmt_section(section) {
            Ok(pmt) => pmt,
            Err(err) => {
                log::warn!("discarding PMT: {}", err);
                return;
            }
        };
        if !pmt.current_next {
            return;
        }
        if let Some(number) = self.config.program_number {
            if pmt.program_number != number {
                return;
            }
        }

        self.pcr_pid = Some(pmt.pcr_pid);
        self.video_pid = pmt.video_stream().map(|s| s.elementary_pid);
        self.audio_pid = if self.config.video_only {
            None
        } else {
            pmt.audio_stream().map(|s| s.elementary_pid)
        };
        self.pmt.replace(Arc::new(pmt));
    }

    fn is_selected_pid(&self, pid: u16) -> bool {
        Some(pid) == self.video_pid || Some(pid) == self.audio_pid
    }

    async fn mirror_pes(&mut self, pes: &PesPacket) -> Result<()> {
        let Some(muxer) = self.mirror.as_mut() else {
            return Ok(());
        };
        if self.mirrored_since_psi == 0 {
            if let (Some(pat), Some(pmt_pid), Some(pmt)) =
                (self.pat.clone(), self.pmt_pid, self.pmt.snapshot())
            {
                muxer.write_psi(&pat, pmt_pid, &pmt).await?;
            }
        }
        self.mirrored_since_psi =
            (self.mirrored_since_psi + 1) % self.config.mirror_psi_interval.max(1);
        muxer.write_pes(pes).await?;
        muxer.flush().await
    }

    /// Internal step: returns the next PES packet of the selected program.
    async fn next_packet_inner(&mut self) -> Result<Option<PesPacket>> {
        loop {
            let Some(packet) = self.reader.read_next_packet().await? else {
                // EOF: flush whatever is still accumulating, video first.
                let pid = [self.video_pid, self.audio_pid]
                    .into_iter()
                    .flatten()
                    .find(|pid| self.accumulators.contains_key(pid));
                let Some(pid) = pid else { return Ok(None) };
                let acc = self.accumulators.remove(&pid).unwrap();
                if acc.data.is_empty() {
                    continue;
                }
                match acc.finish(pid) {
                    Ok(pes) => return Ok(Some(pes)),
                    Err(err) => {
                        self.bad_pes_packets += 1;
                        log::warn!("dropping trailing PES on pid {:#06x}: {}", pid, err);
                        continue;
                    }
                }
            };

            let split = match self.parser.split(&packet.data) {
                Ok(split) => split,
                Err(err) => {
                    log::warn!("skipping unparsable packet at {}: {}", packet.offset, err);
                    continue;
                }
            };
            let header = &split.header;

            if header.transport_error || header.pid == PID_NULL {
                continue;
            }

            // PCRs can arrive on adaptation-only packets.
            if Some(header.pid) == self.pcr_pid {
                if let Some(pcr) = split.adaptation.as_ref().and_then(|a| a.pcr) {
                    self.last_pcr = Some(PcrObservation {
                        pcr,
                        byte_offset: packet.offset,
                        packet_index: packet.index,
                    });
                }
            }

            let Some(payload_offset) = split.payload_offset else {
                continue;
            };
            let payload = &packet.data[payload_offset..];

            if header.pid == PID_PAT {
                for section in self.assembler.push(header.pid, header.payload_unit_start, payload)
                {
                    self.handle_pat_section(&section);
                }
                continue;
            }
            if Some(header.pid) == self.pmt_pid {
                for section in self.assembler.push(header.pid, header.payload_unit_start, payload)
                {
                    self.handle_pmt_section(&section);
                }
                continue;
            }

            if !self.is_selected_pid(header.pid) {
                continue;
            }

            let mut finished: Option<PesPacket> = None;

            if header.payload_unit_start {
                if let Some(acc) = self.accumulators.remove(&header.pid) {
                    if !acc.data.is_empty() {
                        match acc.finish(header.pid) {
                            Ok(pes) => finished = Some(pes),
                            Err(err) => {
                                self.bad_pes_packets += 1;
                                log::warn!(
                                    "dropping malformed PES on pid {:#06x}: {}",
                                    header.pid,
                                    err
                                );
                            }
                        }
                    }
                }
                let mut acc = PesAccumulator::new(packet.offset, packet.index);
                acc.push(payload);
                self.accumulators.insert(header.pid, acc);
            } else if let Some(acc) = self.accumulators.get_mut(&header.pid) {
                acc.push(payload);
            }
            // A payload before the first pusi on this PID is discarded.

            // Bounded PES packets complete without waiting for the next pusi.
            if finished.is_none() {
                let complete = self
                    .accumulators
                    .get(&header.pid)
                    .map(|acc| acc.is_complete())
                    .unwrap_or(false);
                if complete {
                    let acc = self.accumulators.remove(&header.pid).unwrap();
                    match acc.finish(header.pid) {
                        Ok(pes) => finished = Some(pes),
                        Err(err) => {
                            self.bad_pes_packets += 1;
                            log::warn!(
                                "dropping malformed PES on pid {:#06x}: {}",
                                header.pid,
                                err
                            );
                        }
                    }
                }
            }

            if let Some(pes) = finished {
                return Ok(Some(pes));
            }
        }
    }

    /// Returns the next PES packet, mirroring it if a mirror is attached.
    pub async fn next_pes_packet(&mut self) -> Result<Option<PesPacket>> {
        match self.next_packet_inner().await? {
            Some(pes) => {
                self.mirror_pes(&pes).await?;
                Ok(Some(pes))
            }
            None => Ok(None),
        }
    }

    /// Gives back the underlying reader.
    pub fn into_reader(self) -> TsReader<R> {
        self.reader
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> PesSource for TsDemuxer<R> {
    async fn next_pes_packet(&mut self) -> Result<Option<PesPacket>> {
        TsDemuxer::next_pes_packet(self).await
    }
}
