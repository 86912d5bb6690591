use crate::error::{Result, TsioError};
use crate::utils::clock::Pcr;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Hard upper bound on TS packets per item.
pub const MAX_PACKETS_PER_ITEM: usize = 100;

/// Default TS packets per item (7 × 188 = 1316 bytes per datagram).
pub const DEFAULT_PACKETS_PER_ITEM: usize = 7;

/// Default producer poll interval while the ring is full.
pub const DEFAULT_PRODUCER_WAIT: Duration = Duration::from_millis(50);

/// Default consumer poll interval while the ring is empty.
pub const DEFAULT_CONSUMER_WAIT: Duration = Duration::from_millis(10);

/// Poll intervals after which a silent peer is considered dead (~10 s).
pub const GIVE_UP_AFTER: u32 = 200;

/// One producer-to-consumer hand-off: a bundle of TS packets with its
/// computed departure time.
#[derive(Debug, Clone)]
pub struct PacingItem {
    /// Monotone sequence number assigned at staging
    pub sequence: u64,
    /// `n_packets * 188` bytes (a single non-0x47 byte for EOS)
    pub payload: Vec<u8>,
    /// TS packets in the payload
    pub n_packets: usize,
    /// Departure time on the 27 MHz pacing timeline; `None` while staged
    pub release: Option<Pcr>,
    /// The pacer observed a timeline break before this item
    pub discontinuity: bool,
    /// In-band end-of-stream marker
    pub eos: bool,
}

impl PacingItem {
    /// Builds a normal item from packet bytes.
    pub fn new(sequence: u64, payload: Vec<u8>, n_packets: usize) -> Self {
        debug_assert!(n_packets <= MAX_PACKETS_PER_ITEM);
        Self {
            sequence,
            payload,
            n_packets,
            release: None,
            discontinuity: false,
            eos: false,
        }
    }

    /// Builds the terminal EOS item: one byte that is not a sync byte.
    pub fn end_of_stream(sequence: u64) -> Self {
        Self {
            sequence,
            payload: vec![0x00],
            n_packets: 0,
            release: None,
            discontinuity: false,
            eos: true,
        }
    }
}

#[derive(Debug)]
struct RingState {
    slots: Vec<Option<PacingItem>>,
    /// Next slot the consumer reads
    start: usize,
    /// Last published slot; `start == (end+1) % cap` means empty
    end: usize,
    /// Next slot the producer stages into
    pending: usize,
}

impl RingState {
    fn is_empty(&self) -> bool {
        self.start == (self.end + 1) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        (self.pending + 2) % self.slots.len() == self.start
    }
}

/// Fixed-capacity single-producer/single-consumer ring of [`PacingItem`]s.
///
/// The producer *stages* items (advancing `pending`) and *publishes* them
/// (advancing `end`) once their release times are known; in the
/// source-timed modes the two happen together, in the buffer-timed modes a
/// PCR pair is needed before staged items can be stamped and published. One
/// slot is sacrificed so full/empty are distinguishable.
pub struct PacingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    producer_wait: Duration,
    consumer_wait: Duration,
    /// Set by the pacer once any PCR has been seen
    pcr_seen: AtomicBool,
    /// Whether the configured mode needs PCRs to publish
    needs_pcr: bool,
    producer_done: AtomicBool,
    consumer_gone: AtomicBool,
}

impl PacingBuffer {
    /// Creates a ring with `capacity` slots.
    pub fn new(capacity: usize, needs_pcr: bool) -> Self {
        Self::with_waits(
            capacity,
            needs_pcr,
            DEFAULT_PRODUCER_WAIT,
            DEFAULT_CONSUMER_WAIT,
        )
    }

    /// Creates a ring with explicit poll intervals.
    pub fn with_waits(
        capacity: usize,
        needs_pcr: bool,
        producer_wait: Duration,
        consumer_wait: Duration,
    ) -> Self {
        assert!(capacity >= 4, "pacing ring needs at least 4 slots");
        Self {
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                start: 0,
                end: capacity - 1,
                pending: 0,
            }),
            capacity,
            producer_wait,
            consumer_wait,
            pcr_seen: AtomicBool::new(false),
            needs_pcr,
            producer_done: AtomicBool::new(false),
            consumer_gone: AtomicBool::new(false),
        }
    }

    /// Ring capacity in slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records that a PCR has been observed (clears the jam condition).
    pub fn mark_pcr_seen(&self) {
        self.pcr_seen.store(true, Ordering::Release);
    }

    /// Consumer calls this to make the producer stop at its next write.
    pub fn mark_consumer_gone(&self) {
        self.consumer_gone.store(true, Ordering::Release);
    }

    /// True once the consumer has given up.
    pub fn consumer_gone(&self) -> bool {
        self.consumer_gone.load(Ordering::Acquire)
    }

    /// Producer calls this after staging the EOS item.
    fn mark_producer_done(&self) {
        self.producer_done.store(true, Ordering::Release);
    }

    /// Stages `item` into the next pending slot, blocking while the ring is
    /// full. Returns the slot index for later stamping.
    ///
    /// Filling the ring with staged-but-unpublishable items before any PCR
    /// has been seen is the fatal jam condition.
    pub async fn stage(&self, item: PacingItem) -> Result<usize> {
        let mut waits = 0u32;
        loop {
            if self.consumer_gone() {
                return Err(TsioError::InvalidData(
                    "consumer gone; producer stopping".into(),
                ));
            }
            {
                let mut state = self.state.lock();
                if !state.is_full() {
                    let slot = state.pending;
                    state.slots[slot] = Some(item);
                    state.pending = (state.pending + 1) % self.capacity;
                    return Ok(slot);
                }
                if self.needs_pcr
                    && state.is_empty()
                    && !self.pcr_seen.load(Ordering::Acquire)
                {
                    // Every slot is staged, nothing publishable, and no PCR
                    // will ever stamp them.
                    return Err(TsioError::BufferJammed);
                }
            }
            waits += 1;
            if waits > GIVE_UP_AFTER {
                return Err(TsioError::InvalidData(
                    "consumer has not drained the ring for too long".into(),
                ));
            }
            tokio::time::sleep(self.producer_wait).await;
        }
    }

    /// Sets the release time of a staged item.
    pub fn stamp(&self, slot: usize, release: Pcr, discontinuity: bool) {
        let mut state = self.state.lock();
        if let Some(item) = state.slots[slot].as_mut() {
            item.release = Some(release);
            if discontinuity {
                item.discontinuity = true;
            }
        }
    }

    /// Publishes every staged slot up to and including `slot`.
    pub fn publish_through(&self, slot: usize) {
        let mut state = self.state.lock();
        state.end = slot;
    }

    /// Stages and immediately publishes (source-timed modes).
    pub async fn push(&self, item: PacingItem) -> Result<()> {
        let eos = item.eos;
        let slot = self.stage(item).await?;
        self.publish_through(slot);
        if eos {
            self.mark_producer_done();
        }
        Ok(())
    }

    /// Stages the EOS item and publishes everything staged before it.
    ///
    /// In the buffer-timed modes items staged after the last PCR pair can
    /// never be stamped; they are released with no departure time so the
    /// consumer drains them at line rate.
    pub async fn finish(&self, sequence: u64) -> Result<()> {
        let slot = self.stage(PacingItem::end_of_stream(sequence)).await?;
        self.publish_through(slot);
        self.mark_producer_done();
        Ok(())
    }

    /// Takes the next published item, blocking while the ring is empty.
    ///
    /// Returns `None` when the ring is empty and the producer is done (a
    /// well-formed stream ends with the EOS item instead), or when the
    /// producer has been silent past the give-up threshold.
    pub async fn next_item(&self) -> Result<Option<PacingItem>> {
        let mut waits = 0u32;
        loop {
            {
                let mut state = self.state.lock();
                if !state.is_empty() {
                    let slot = state.start;
                    let item = state.slots[slot].take();
                    state.start = (state.start + 1) % self.capacity;
                    if let Some(item) = item {
                        return Ok(Some(item));
                    }
                    // A published slot is never empty; treat as fatal.
                    return Err(TsioError::InvalidData(
                        "pacing ring published an empty slot".into(),
                    ));
                }
                if self.producer_done.load(Ordering::Acquire) {
                    return Ok(None);
                }
            }
            waits += 1;
            if waits > GIVE_UP_AFTER {
                self.mark_consumer_gone();
                return Ok(None);
            }
            tokio::time::sleep(self.consumer_wait).await;
        }
    }

    /// Number of published, undrained items.
    pub fn published_len(&self) -> usize {
        let state = self.state.lock();
        (state.end + 1 + self.capacity - state.start) % self.capacity
    }
}
