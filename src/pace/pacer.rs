use super::buffer::{PacingBuffer, DEFAULT_PACKETS_PER_ITEM};
use crate::utils::clock::{pcr_diff, Pcr, PCR_HZ, PCR_WRAP};
use std::sync::Arc;
use std::time::Duration;

/// How the departure time of each item is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcrMode {
    /// Ignore PCRs; pace at the configured byte rate
    None,
    /// Source-timed: a running byte/time window fed by PCRs as they pass
    #[default]
    Mode1Src,
    /// Buffer-timed: stage items between PCRs, interpolate on the second,
    /// taking PCRs from any adaptation field
    Mode2DstTs,
    /// Buffer-timed, but only PCRs on the PMT-declared PCR PID count
    Mode2DstPmt,
}

impl PcrMode {
    /// True for the modes that stage items until a PCR pair is seen.
    pub fn is_buffer_timed(self) -> bool {
        matches!(self, Self::Mode2DstTs | Self::Mode2DstPmt)
    }

    /// True when the mode cannot make progress without PCRs.
    pub fn needs_pcr(self) -> bool {
        self != Self::None
    }
}

/// Configuration of the paced output engine.
#[derive(Debug, Clone)]
pub struct PaceConfig {
    /// Pacing mode
    pub mode: PcrMode,
    /// Nominal byte rate for `PcrMode::None` and for priming
    pub byte_rate: u64,
    /// Items released at priming rate before real timing is known
    pub prime_size: usize,
    /// Priming rate as a percentage of `byte_rate` (100 = nominal)
    pub prime_speedup: u32,
    /// Multiplicative factor applied to every PCR (slow/fast simulation)
    pub pcr_scale: f64,
    /// TS packets per item (and per datagram)
    pub packets_per_item: usize,
    /// Ring capacity in items
    pub capacity: usize,
    /// Prepend an RTP header to each outgoing datagram
    pub rtp: bool,
    /// Consecutive zero-wait sends allowed before a forced pause
    pub max_nowait: u32,
    /// The forced pause inserted after `max_nowait` zero-wait sends
    pub waitfor: Duration,
    /// Uniform jitter (± this many ms) added to each computed wait
    pub perturb_ms: Option<u32>,
}

impl Default for PaceConfig {
    fn default() -> Self {
        Self {
            mode: PcrMode::default(),
            byte_rate: 250_000,
            prime_size: 10,
            prime_speedup: 100,
            pcr_scale: 1.0,
            packets_per_item: DEFAULT_PACKETS_PER_ITEM,
            capacity: 1024,
            rtp: false,
            max_nowait: 1000,
            waitfor: Duration::from_millis(1),
            perturb_ms: None,
        }
    }
}

/// A forward PCR jump above this is a timeline discontinuity.
const DISCONTINUITY_GAP: i64 = 2 * PCR_HZ as i64;

/// An item staged in a buffer-timed mode, awaiting its stamp.
#[derive(Debug, Clone, Copy)]
struct StagedItem {
    slot: usize,
    /// Byte position of the item's first packet in the stream
    byte_pos: u64,
}

/// Computes per-item departure times from observed PCRs.
///
/// In the source-timed modes (`None`, `Mode1Src`) every item gets its
/// release as it is pushed. In the buffer-timed modes items are staged in
/// the ring; when the second PCR of a segment arrives each staged item is
/// stamped by linear interpolation between the two PCRs and published.
pub struct PcrPacer {
    mode: PcrMode,
    buffer: Arc<PacingBuffer>,
    /// Priming rate in bytes per second
    prime_rate: f64,
    /// Next release on the pacing timeline, in 27 MHz ticks
    next_release: f64,
    // Mode1 window
    window_bytes: f64,
    window_ticks: f64,
    rate_known: bool,
    last_pcr: Option<Pcr>,
    bytes_at_last_pcr: u64,
    // Mode2 segment state
    staged: Vec<StagedItem>,
    segment_start: Option<(Pcr, u64)>,
    prev_gap: Option<(i64, u64)>,
    /// Set on reset; transferred to the next stamped or pushed item
    pending_discontinuity: bool,
    pcr_scale: f64,
    prime_size: usize,
    items_released: u64,
    /// Discontinuities observed
    pub discontinuities: u64,
    /// PCR regressions or oversized gaps
    pub pcr_errors: u64,
}

impl PcrPacer {
    /// Creates a pacer feeding `buffer`.
    pub fn new(config: &PaceConfig, buffer: Arc<PacingBuffer>) -> Self {
        Self {
            mode: config.mode,
            buffer,
            prime_rate: config.byte_rate as f64 * f64::from(config.prime_speedup) / 100.0,
            next_release: 0.0,
            window_bytes: 0.0,
            window_ticks: 0.0,
            rate_known: false,
            last_pcr: None,
            bytes_at_last_pcr: 0,
            staged: Vec::new(),
            segment_start: None,
            prev_gap: None,
            pending_discontinuity: false,
            pcr_scale: config.pcr_scale,
            prime_size: config.prime_size,
            items_released: 0,
            discontinuities: 0,
            pcr_errors: 0,
        }
    }

    fn scale(&self, pcr: Pcr) -> Pcr {
        if (self.pcr_scale - 1.0).abs() < f64::EPSILON {
            pcr
        } else {
            Pcr(((pcr.0 as f64 * self.pcr_scale) as u64) % PCR_WRAP)
        }
    }

    /// Feeds one PCR observation at stream byte position `byte_pos`.
    pub fn on_pcr(&mut self, pcr: Pcr, byte_pos: u64) {
        let pcr = self.scale(pcr);
        self.buffer.mark_pcr_seen();

        match self.mode {
            PcrMode::None => {}
            PcrMode::Mode1Src => self.on_pcr_mode1(pcr, byte_pos),
            PcrMode::Mode2DstTs | PcrMode::Mode2DstPmt => self.on_pcr_mode2(pcr, byte_pos),
        }
    }

    fn on_pcr_mode1(&mut self, pcr: Pcr, byte_pos: u64) {
        let Some(last) = self.last_pcr else {
            self.last_pcr = Some(pcr);
            self.bytes_at_last_pcr = byte_pos;
            return;
        };

        let dticks = pcr_diff(pcr, last);
        let dbytes = byte_pos.saturating_sub(self.bytes_at_last_pcr);

        if dticks <= 0 || dticks > DISCONTINUITY_GAP {
            self.pcr_errors += 1;
            if dticks > DISCONTINUITY_GAP {
                self.reset_after_discontinuity();
            }
            self.last_pcr = Some(pcr);
            self.bytes_at_last_pcr = byte_pos;
            return;
        }

        if !self.rate_known {
            // Second PCR: the real rate replaces the priming assumption.
            self.window_bytes = dbytes as f64;
            self.window_ticks = dticks as f64;
            self.rate_known = true;
        } else {
            self.window_bytes += dbytes as f64;
            self.window_ticks += dticks as f64;
        }
        self.last_pcr = Some(pcr);
        self.bytes_at_last_pcr = byte_pos;
    }

    fn on_pcr_mode2(&mut self, pcr: Pcr, byte_pos: u64) {
        let Some((segment_pcr, segment_bytes)) = self.segment_start else {
            self.segment_start = Some((pcr, byte_pos));
            return;
        };

        let gap_ticks = pcr_diff(pcr, segment_pcr);
        let gap_bytes = byte_pos.saturating_sub(segment_bytes);

        if gap_ticks <= 0 || gap_ticks > DISCONTINUITY_GAP {
            self.pcr_errors += 1;
            if gap_ticks > DISCONTINUITY_GAP {
                self.reset_after_discontinuity();
            }
            // Staged items of the broken segment go out unstamped.
            if let Some(last) = self.staged.last() {
                self.buffer.publish_through(last.slot);
            }
            self.staged.clear();
            self.segment_start = Some((pcr, byte_pos));
            return;
        }

        if gap_bytes == 0 {
            self.segment_start = Some((pcr, byte_pos));
            return;
        }

        let mut last_slot = None;
        let mut discontinuity = std::mem::take(&mut self.pending_discontinuity);
        for item in self.staged.drain(..) {
            let offset = item.byte_pos.saturating_sub(segment_bytes);
            let ticks = segment_pcr.0 + offset * gap_ticks as u64 / gap_bytes;
            self.buffer.stamp(item.slot, Pcr(ticks % PCR_WRAP), discontinuity);
            discontinuity = false;
            last_slot = Some(item.slot);
        }
        if let Some(slot) = last_slot {
            self.buffer.publish_through(slot);
        }

        self.prev_gap = Some((gap_ticks, gap_bytes));
        self.segment_start = Some((pcr, byte_pos));
    }

    fn reset_after_discontinuity(&mut self) {
        self.discontinuities += 1;
        self.pending_discontinuity = true;
        self.rate_known = false;
        self.last_pcr = None;
        self.window_bytes = 0.0;
        self.window_ticks = 0.0;
        self.prev_gap = None;
        self.segment_start = None;
        log::warn!("pcr discontinuity: pacer re-priming");
    }

    /// Source-timed modes: the release time for an item of `bytes` bytes.
    /// Also drains the Mode1 window proportionally.
    pub fn release_for_item(&mut self, bytes: usize) -> (Pcr, bool) {
        let release = Pcr((self.next_release as u64) % PCR_WRAP);
        let discontinuity = std::mem::take(&mut self.pending_discontinuity);

        self.items_released += 1;
        if self.mode.needs_pcr()
            && !self.rate_known
            && self.items_released == self.prime_size as u64
        {
            log::debug!("{} items primed with no PCR yet", self.items_released);
        }

        let dticks = match self.mode {
            PcrMode::Mode1Src if self.rate_known && self.window_bytes > 0.0 => {
                let share = bytes as f64 / self.window_bytes;
                let ticks = share * self.window_ticks;
                self.window_bytes -= bytes as f64;
                self.window_ticks -= ticks;
                if self.window_bytes <= 0.0 {
                    // Window drained dry; hold the real rate until refilled.
                    self.window_bytes = 0.0;
                    self.window_ticks = 0.0;
                }
                ticks
            }
            _ => bytes as f64 * PCR_HZ as f64 / self.prime_rate,
        };
        self.next_release += dticks;
        (release, discontinuity)
    }

    /// Buffer-timed modes: notes a staged item. When the previous segment's
    /// gap is known the item is stamped immediately by extrapolation.
    pub fn note_staged(&mut self, slot: usize, byte_pos: u64) {
        if let (Some((segment_pcr, segment_bytes)), Some((gap_ticks, gap_bytes))) =
            (self.segment_start, self.prev_gap)
        {
            let offset = byte_pos.saturating_sub(segment_bytes);
            let ticks = segment_pcr.0 + offset * gap_ticks as u64 / gap_bytes;
            let discontinuity = std::mem::take(&mut self.pending_discontinuity);
            self.buffer.stamp(slot, Pcr(ticks % PCR_WRAP), discontinuity);
            self.buffer.publish_through(slot);
            return;
        }
        self.staged.push(StagedItem { slot, byte_pos });
    }

    /// True when the pacer still has unpublished staged items.
    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Publishes any still-staged items unstamped (used at end of stream).
    pub fn flush_staged(&mut self) {
        if let Some(last) = self.staged.last() {
            self.buffer.publish_through(last.slot);
        }
        self.staged.clear();
    }
}
