use super::parser::TsPacketParser;
use super::pes::PesHeader;
use super::psi::{parse_pat_section, parse_pmt_section, SectionAssembler};
use super::types::*;
use crate::utils::clock::{pcr_diff, ticks_90k_diff, Pcr, PCR_HZ};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Configuration for [`StreamAnalyzer`].
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// PCR gap above this many milliseconds is reported as an error
    pub max_pcr_gap_ms: u64,
    /// Linear-prediction divergence (27 MHz ticks) worth reporting
    pub prediction_threshold: i64,
    /// Width of the bitrate window in 27 MHz ticks
    pub bitrate_window: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_pcr_gap_ms: 100,
            prediction_threshold: PCR_HZ as i64 / 10,
            bitrate_window: PCR_HZ / 2,
        }
    }
}

/// Running min/max/mean of a signed difference series.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffStats {
    /// Smallest difference seen
    pub min: i64,
    /// Largest difference seen
    pub max: i64,
    sum: i128,
    count: u64,
}

impl DiffStats {
    fn record(&mut self, diff: i64) {
        if self.count == 0 {
            self.min = diff;
            self.max = diff;
        } else {
            self.min = self.min.min(diff);
            self.max = self.max.max(diff);
        }
        self.sum += i128::from(diff);
        self.count += 1;
    }

    /// Mean of the recorded differences, if any were recorded.
    pub fn mean(&self) -> Option<i64> {
        if self.count == 0 {
            None
        } else {
            Some((self.sum / i128::from(self.count)) as i64)
        }
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Continuity-counter tracking for one PID.
#[derive(Debug, Default)]
struct CcState {
    last_cc: Option<u8>,
    last_packet: Option<Bytes>,
    /// The single tolerated duplicate has been used since the last advance
    duplicate_used: bool,
    gap_reported: bool,
    duplicate_reported: bool,
}

/// Per-PID statistics accumulated while scanning.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// stream_type from the PMT, once known
    pub stream_type: Option<u8>,
    /// First and last PCR seen on this PID
    pub first_pcr: Option<Pcr>,
    /// Last PCR seen on this PID
    pub last_pcr: Option<Pcr>,
    /// First and last PTS
    pub first_pts: Option<u64>,
    /// Last PTS
    pub last_pts: Option<u64>,
    /// First and last DTS
    pub first_dts: Option<u64>,
    /// Last DTS
    pub last_dts: Option<u64>,
    /// PCR−PTS in 90 kHz ticks
    pub pcr_minus_pts: DiffStats,
    /// PCR−DTS in 90 kHz ticks
    pub pcr_minus_dts: DiffStats,
    /// Continuity-counter gaps
    pub cc_errors: u64,
    /// Tolerated duplicate packets
    pub duplicate_packets: u64,
    /// Duplicates beyond the single tolerated one
    pub duplicate_errors: u64,
    /// Discontinuity-flagged packets
    pub discontinuities: u64,
    /// PTS < DTS violations
    pub pts_dts_errors: u64,
    /// DTS regressions
    pub dts_order_errors: u64,
    /// DTS behind the current PCR
    pub dts_pcr_errors: u64,
    /// PCR regressions or oversized gaps
    pub pcr_errors: u64,
    /// Payload bytes seen on this PID
    pub bytes_seen: u64,
    /// Highest bitrate over the configured window, bits per second
    pub max_bitrate: u64,
    /// Linear PCR prediction error range (27 MHz ticks)
    pub prediction_error: DiffStats,
}

/// Internal per-PID state not part of the report.
#[derive(Debug, Default)]
struct PidState {
    stats: StreamStats,
    cc: CcState,
    /// (pcr, cumulative bytes at that observation) for the bitrate window
    window: VecDeque<(Pcr, u64)>,
    /// First two PCRs fix the prediction rate
    predictor: Option<PcrPredictor>,
    pcr_anchor: Option<(Pcr, u64)>,
}

#[derive(Debug, Clone, Copy)]
struct PcrPredictor {
    origin_pcr: Pcr,
    origin_bytes: u64,
    /// 27 MHz ticks per stream byte
    ticks_per_byte: f64,
}

/// Scans TS packets and maintains per-PID timing, continuity and rate
/// statistics. Self-contained: it discovers PAT/PMT itself.
pub struct StreamAnalyzer {
    config: AnalyzerConfig,
    parser: TsPacketParser,
    assembler: SectionAssembler,
    pmt_pids: Vec<u16>,
    pcr_pid: Option<u16>,
    pids: HashMap<u16, PidState>,
    /// Most recent PCR from the program's PCR PID, for DTS/PCR checks
    current_pcr: Option<Pcr>,
    /// Total packets scanned
    pub packets_scanned: u64,
    /// Total bytes scanned
    pub bytes_scanned: u64,
}

impl StreamAnalyzer {
    /// Creates an analyzer with `config`.
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            parser: TsPacketParser::new(),
            assembler: SectionAssembler::new(),
            pmt_pids: Vec::new(),
            pcr_pid: None,
            pids: HashMap::new(),
            current_pcr: None,
            packets_scanned: 0,
            bytes_scanned: 0,
        }
    }

    /// Feeds one packet. All problems are counted, never fatal.
    pub fn push_packet(&mut self, packet: &TsPacket) {
        self.packets_scanned += 1;
        self.bytes_scanned += packet.data.len() as u64;

        let Ok(split) = self.parser.split(&packet.data) else {
            return;
        };
        let header = &split.header;
        let pid = header.pid;
        if pid == PID_NULL {
            return;
        }

        let discontinuity = split
            .adaptation
            .as_ref()
            .map(|a| a.discontinuity)
            .unwrap_or(false);
        let pcr = split.adaptation.as_ref().and_then(|a| a.pcr);

        // PSI discovery.
        if let Some(payload_offset) = split.payload_offset {
            let payload = &packet.data[payload_offset..];
            if pid == PID_PAT {
                for section in self.assembler.push(pid, header.payload_unit_start, payload) {
                    if let Ok(pat) = parse_pat_section(&section) {
                        self.pmt_pids = pat
                            .entries
                            .iter()
                            .filter(|e| e.program_number != 0)
                            .map(|e| e.pid)
                            .collect();
                    }
                }
            } else if self.pmt_pids.contains(&pid) {
                for section in self.assembler.push(pid, header.payload_unit_start, payload) {
                    if let Ok(pmt) = parse_pmt_section(&section) {
                        if self.pcr_pid.is_none() {
                            self.pcr_pid = Some(pmt.pcr_pid);
                        }
                        for stream in &pmt.streams {
                            self.pids
                                .entry(stream.elementary_pid)
                                .or_default()
                                .stats
                                .stream_type = Some(stream.stream_type);
                        }
                    }
                }
            }
        }

        let max_gap = (self.config.max_pcr_gap_ms * PCR_HZ / 1000) as i64;
        let prediction_threshold = self.config.prediction_threshold;
        let window_width = self.config.bitrate_window;

        let state = self.pids.entry(pid).or_default();

        if discontinuity {
            state.stats.discontinuities += 1;
            state.predictor = None;
            state.pcr_anchor = None;
        }

        // Continuity counter machine.
        Self::check_continuity(state, header, packet, discontinuity);

        state.stats.bytes_seen += packet.data.len() as u64;

        // PCR bookkeeping on whatever PID carries one.
        if let Some(pcr) = pcr {
            if pid == self.pcr_pid.unwrap_or(pid) {
                self.current_pcr = Some(pcr);
            }
            Self::check_pcr(
                state,
                pcr,
                self.bytes_scanned,
                packet.offset,
                discontinuity,
                max_gap,
                prediction_threshold,
            );
            Self::update_bitrate_window(state, pcr, window_width);
        }

        // PES timestamps at payload unit starts.
        if header.payload_unit_start && !self.pmt_pids.contains(&pid) && pid != PID_PAT {
            if let Some(payload_offset) = split.payload_offset {
                let payload = &packet.data[payload_offset..];
                if payload.len() >= 6 && payload[..3] == [0, 0, 1] {
                    if let Ok(pes_header) = PesHeader::parse(payload) {
                        Self::check_timestamps(state, &pes_header, self.current_pcr, packet.offset);
                    }
                }
            }
        }
    }

    fn check_continuity(
        state: &mut PidState,
        header: &TsHeader,
        packet: &TsPacket,
        discontinuity: bool,
    ) {
        if !header.has_payload {
            // cc does not advance without payload.
            return;
        }
        let cc = header.continuity_counter;
        let stats = &mut state.stats;
        let cc_state = &mut state.cc;

        if let Some(last) = cc_state.last_cc {
            if discontinuity {
                // Jump explicitly allowed.
            } else if cc == last {
                let identical = cc_state
                    .last_packet
                    .as_ref()
                    .map(|prev| packets_equal_ignoring_pcr(prev, &packet.data))
                    .unwrap_or(false);
                if identical && !cc_state.duplicate_used {
                    cc_state.duplicate_used = true;
                    stats.duplicate_packets += 1;
                } else {
                    stats.duplicate_errors += 1;
                    if !cc_state.duplicate_reported {
                        cc_state.duplicate_reported = true;
                        log::warn!(
                            "pid {:#06x}: disallowed duplicate at offset {}",
                            header.pid,
                            packet.offset
                        );
                    }
                }
                cc_state.last_packet = Some(packet.data.clone());
                return;
            } else if cc != (last + 1) & 0x0F {
                stats.cc_errors += 1;
                if !cc_state.gap_reported {
                    cc_state.gap_reported = true;
                    log::warn!(
                        "pid {:#06x}: continuity counter {} where {} expected, offset {}",
                        header.pid,
                        cc,
                        (last + 1) & 0x0F,
                        packet.offset
                    );
                }
            }
        }

        cc_state.last_cc = Some(cc);
        cc_state.last_packet = Some(packet.data.clone());
        cc_state.duplicate_used = false;
    }

    #[allow(clippy::too_many_arguments)]
    fn check_pcr(
        state: &mut PidState,
        pcr: Pcr,
        stream_bytes: u64,
        offset: u64,
        discontinuity: bool,
        max_gap: i64,
        prediction_threshold: i64,
    ) {
        let stats = &mut state.stats;
        if stats.first_pcr.is_none() {
            stats.first_pcr = Some(pcr);
        }

        if let Some(last) = stats.last_pcr {
            let diff = pcr_diff(pcr, last);
            if !discontinuity {
                if diff <= 0 {
                    stats.pcr_errors += 1;
                    log::warn!("pcr regression at offset {}: {:?} after {:?}", offset, pcr, last);
                } else if diff > max_gap {
                    stats.pcr_errors += 1;
                    log::warn!(
                        "pcr gap of {} ms at offset {}",
                        diff as u64 / (PCR_HZ / 1000),
                        offset
                    );
                }
            }
        }
        stats.last_pcr = Some(pcr);

        // Linear prediction: the first two PCRs fix the rate.
        match (&mut state.predictor, state.pcr_anchor) {
            (Some(predictor), _) => {
                let predicted_ticks = (stream_bytes - predictor.origin_bytes) as f64
                    * predictor.ticks_per_byte;
                let predicted = Pcr(
                    (predictor.origin_pcr.0 + predicted_ticks as u64)
                        % crate::utils::clock::PCR_WRAP,
                );
                let error = pcr_diff(pcr, predicted);
                stats.prediction_error.record(error);
                if error.abs() > prediction_threshold {
                    log::debug!(
                        "pcr diverges from linear prediction by {} ticks at offset {}",
                        error,
                        offset
                    );
                }
            }
            (None, Some((anchor_pcr, anchor_bytes))) => {
                let dticks = pcr_diff(pcr, anchor_pcr);
                let dbytes = stream_bytes.saturating_sub(anchor_bytes);
                if dticks > 0 && dbytes > 0 {
                    state.predictor = Some(PcrPredictor {
                        origin_pcr: pcr,
                        origin_bytes: stream_bytes,
                        ticks_per_byte: dticks as f64 / dbytes as f64,
                    });
                }
            }
            (None, None) => {
                state.pcr_anchor = Some((pcr, stream_bytes));
            }
        }
    }

    fn update_bitrate_window(state: &mut PidState, pcr: Pcr, window_width: u64) {
        let bytes = state.stats.bytes_seen;
        state.window.push_back((pcr, bytes));

        while let Some(&(oldest, _)) = state.window.front() {
            if pcr_diff(pcr, oldest) > window_width as i64 {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if let (Some(&(oldest, oldest_bytes)), 2..) = (state.window.front(), state.window.len()) {
            let dt = pcr_diff(pcr, oldest);
            if dt > 0 {
                let rate = (bytes - oldest_bytes) * 8 * PCR_HZ / dt as u64;
                state.stats.max_bitrate = state.stats.max_bitrate.max(rate);
            }
        }
    }

    fn check_timestamps(
        state: &mut PidState,
        pes: &PesHeader,
        current_pcr: Option<Pcr>,
        offset: u64,
    ) {
        let stats = &mut state.stats;

        if let Some(pts) = pes.pts {
            if stats.first_pts.is_none() {
                stats.first_pts = Some(pts);
            }
            stats.last_pts = Some(pts);
            if let Some(pcr) = current_pcr {
                stats.pcr_minus_pts.record(ticks_90k_diff(pcr.base(), pts));
            }
        }

        if let Some(dts) = pes.dts {
            if let Some(pts) = pes.pts {
                if ticks_90k_diff(pts, dts) < 0 {
                    stats.pts_dts_errors += 1;
                    log::warn!("PTS behind DTS at offset {}", offset);
                }
            }
            if let Some(last_dts) = stats.last_dts {
                if ticks_90k_diff(dts, last_dts) < 0 {
                    stats.dts_order_errors += 1;
                    log::warn!("DTS regression at offset {}", offset);
                }
            }
            if let Some(pcr) = current_pcr {
                if ticks_90k_diff(dts, pcr.base()) < 0 {
                    stats.dts_pcr_errors += 1;
                }
                stats.pcr_minus_dts.record(ticks_90k_diff(pcr.base(), dts));
            }
            if stats.first_dts.is_none() {
                stats.first_dts = Some(dts);
            }
            stats.last_dts = Some(dts);
        }
    }

    /// Takes the per-PID statistics, ordered by PID.
    pub fn report(self) -> AnalyzerReport {
        AnalyzerReport {
            packets_scanned: self.packets_scanned,
            bytes_scanned: self.bytes_scanned,
            pcr_pid: self.pcr_pid,
            pids: self
                .pids
                .into_iter()
                .map(|(pid, state)| (pid, state.stats))
                .collect(),
        }
    }
}

/// Summary of a scan: global counters plus per-PID statistics.
#[derive(Debug)]
pub struct AnalyzerReport {
    /// Packets scanned
    pub packets_scanned: u64,
    /// Bytes scanned
    pub bytes_scanned: u64,
    /// PCR PID of the first program seen
    pub pcr_pid: Option<u16>,
    /// Statistics per PID
    pub pids: BTreeMap<u16, StreamStats>,
}

/// Compares two packets for the duplicate rule: byte-identical outside the
/// 6 PCR octets (when both carry a PCR at the same position).
fn packets_equal_ignoring_pcr(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a[..4] != b[..4] {
        return false;
    }
    let has_adaptation = a[3] & 0x20 != 0;
    if !has_adaptation || a.len() < 6 {
        return a == b;
    }
    if a[4] != b[4] || a[5] != b[5] {
        return false;
    }
    let pcr_flag = a[4] > 0 && a[5] & 0x10 != 0;
    if !pcr_flag {
        return a == b;
    }
    // Header, length and flag bytes match; skip the 6 PCR bytes.
    let pcr_start = 6;
    let pcr_end = (pcr_start + 6).min(a.len());
    a[pcr_end..] == b[pcr_end..]
}
