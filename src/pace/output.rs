use super::buffer::{PacingBuffer, PacingItem, MAX_PACKETS_PER_ITEM};
use super::pacer::{PaceConfig, PcrPacer};
#[cfg(test)]
use super::pacer::PcrMode;
use crate::error::{Result, TsioError};
use crate::format::rtp::RtpHeader;
use crate::format::ts::types::TS_PACKET_SIZE;
use crate::utils::clock::Pcr;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Longest single sleep while waiting for a release time; the clock is
/// re-evaluated afterwards.
const MAX_SLEEP: Duration = Duration::from_millis(200);

/// Behind-schedule slack before the consumer re-baselines its clock.
const DRIFT_LIMIT_US: i64 = 200_000;

/// Producer-side facade: accumulates TS packets into items and hands them
/// to the ring with release times attached (or staged for stamping, in the
/// buffer-timed modes).
pub struct PacedSender {
    buffer: Arc<PacingBuffer>,
    pacer: PcrPacer,
    config: PaceConfig,
    item: Vec<u8>,
    item_packets: usize,
    item_start_bytes: u64,
    bytes_pushed: u64,
    sequence: u64,
}

impl PacedSender {
    /// Creates a sender and its ring. The returned buffer handle is shared
    /// with the consumer task.
    pub fn new(config: PaceConfig) -> (Self, Arc<PacingBuffer>) {
        let packets_per_item = config.packets_per_item.min(MAX_PACKETS_PER_ITEM).max(1);
        let buffer = Arc::new(PacingBuffer::new(
            config.capacity.max(4),
            config.mode.needs_pcr(),
        ));
        let sender = Self {
            buffer: Arc::clone(&buffer),
            pacer: PcrPacer::new(&config, Arc::clone(&buffer)),
            config: PaceConfig {
                packets_per_item,
                ..config
            },
            item: Vec::with_capacity(packets_per_item * TS_PACKET_SIZE),
            item_packets: 0,
            item_start_bytes: 0,
            bytes_pushed: 0,
            sequence: 0,
        };
        (sender, buffer)
    }

    /// Pacer statistics access.
    pub fn pacer(&self) -> &PcrPacer {
        &self.pacer
    }

    /// Feeds one 188-byte TS packet, with the PCR it carries (if any).
    ///
    /// In `Mode2DstPmt` the caller passes only PCRs from the PMT-declared
    /// PCR PID; in `Mode2DstTs` and `Mode1Src` any adaptation-field PCR is
    /// fed through.
    pub async fn push_packet(&mut self, packet: &[u8], pcr: Option<Pcr>) -> Result<()> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(TsioError::InvalidData(format!(
                "paced packets must be {} bytes, got {}",
                TS_PACKET_SIZE,
                packet.len()
            )));
        }
        if let Some(pcr) = pcr {
            self.pacer.on_pcr(pcr, self.bytes_pushed);
        }

        if self.item.is_empty() {
            self.item_start_bytes = self.bytes_pushed;
        }
        self.item.extend_from_slice(packet);
        self.item_packets += 1;
        self.bytes_pushed += TS_PACKET_SIZE as u64;

        if self.item_packets >= self.config.packets_per_item {
            self.flush_item().await?;
        }
        Ok(())
    }

    async fn flush_item(&mut self) -> Result<()> {
        if self.item.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.item);
        let n_packets = self.item_packets;
        self.item_packets = 0;
        let bytes = payload.len();
        let item_start = self.item_start_bytes;

        let mut item = PacingItem::new(self.sequence, payload, n_packets);
        self.sequence += 1;

        if self.config.mode.is_buffer_timed() {
            let slot = self.buffer.stage(item).await?;
            self.pacer.note_staged(slot, item_start);
        } else {
            let (release, discontinuity) = self.pacer.release_for_item(bytes);
            item.release = Some(release);
            item.discontinuity = discontinuity;
            self.buffer.push(item).await?;
        }
        Ok(())
    }

    /// Flushes the partial item and stages the EOS marker.
    pub async fn finish(mut self) -> Result<()> {
        self.flush_item().await?;
        self.pacer.flush_staged();
        self.buffer.finish(self.sequence).await
    }
}

/// Where outgoing datagrams land. UDP in production; tests collect them.
#[async_trait::async_trait]
pub trait DatagramSink: Send {
    /// Emits one datagram.
    async fn send(&mut self, datagram: &[u8]) -> Result<()>;
}

/// UDP emitter, with optional multicast interface binding.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    /// Binds a socket for `target`. For a multicast target an explicit
    /// outgoing interface address may be given.
    pub async fn bind(target: SocketAddr, interface: Option<std::net::Ipv4Addr>) -> Result<Self> {
        // Binding to the interface address selects the outgoing interface
        // for multicast targets.
        let local = interface.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        let socket = UdpSocket::bind((local, 0)).await?;
        if let SocketAddr::V4(v4) = target {
            if v4.ip().is_multicast() {
                socket.set_multicast_loop_v4(true)?;
                socket.set_multicast_ttl_v4(1)?;
            }
        }
        Ok(Self { socket, target })
    }

    /// The socket's local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait::async_trait]
impl DatagramSink for UdpSink {
    async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.target).await?;
        Ok(())
    }
}

/// Counters the consumer reports when it exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Items emitted
    pub items: u64,
    /// Payload bytes emitted (excluding RTP headers)
    pub bytes: u64,
    /// Times the wall-clock baseline was reset for drift
    pub clock_resets: u64,
    /// Forced pauses inserted by the max-nowait rule
    pub forced_waits: u64,
}

/// The consumer's wall-clock mapping: `release - start_logical` microseconds
/// after `start_wall`.
struct WallClock {
    start_wall: Instant,
    start_logical_us: i64,
}

impl WallClock {
    fn new(release_us: i64) -> Self {
        Self {
            start_wall: Instant::now(),
            start_logical_us: release_us,
        }
    }

    /// Microseconds until `release_us` is due (negative when late).
    fn until(&self, release_us: i64) -> i64 {
        let elapsed = self.start_wall.elapsed().as_micros() as i64;
        release_us - self.start_logical_us - elapsed
    }
}

/// Drains the ring on schedule, emitting each item as one datagram.
///
/// Runs until the EOS item, a dead producer, or a send error. Items before
/// EOS are always drained first; unstamped items go out back to back,
/// subject to the max-nowait rule.
pub async fn run_consumer<S: DatagramSink>(
    buffer: Arc<PacingBuffer>,
    sink: &mut S,
    config: &PaceConfig,
) -> Result<ConsumerStats> {
    let mut stats = ConsumerStats::default();
    let mut clock: Option<WallClock> = None;
    let mut rtp = config.rtp.then(RtpHeader::new);
    let mut last_release = Pcr(0);
    let mut nowait_run = 0u32;

    loop {
        let Some(item) = buffer.next_item().await? else {
            log::warn!("producer went away without an EOS item");
            break;
        };
        if item.eos {
            log::debug!("end of stream after {} items", stats.items);
            break;
        }

        let mut waited = false;
        if let Some(release) = item.release {
            last_release = release;
            let release_us = release.as_micros() as i64;

            if item.discontinuity || clock.is_none() {
                if item.discontinuity {
                    log::debug!("timeline discontinuity: resetting wall clock");
                }
                clock = Some(WallClock::new(release_us));
            }
            let clock_ref = clock.as_mut().expect("clock just initialized");

            loop {
                let ahead = clock_ref.until(release_us);
                if ahead <= 0 {
                    if ahead < -DRIFT_LIMIT_US {
                        log::warn!("{} us behind schedule; resetting baseline", -ahead);
                        *clock_ref = WallClock::new(release_us);
                        stats.clock_resets += 1;
                    }
                    break;
                }
                waited = true;
                let mut sleep_for = Duration::from_micros(ahead as u64).min(MAX_SLEEP);
                if let Some(range) = config.perturb_ms {
                    let jitter = rand::thread_rng().gen_range(-(range as i64)..=range as i64);
                    let perturbed = sleep_for.as_millis() as i64 + jitter;
                    sleep_for = Duration::from_millis(perturbed.max(0) as u64);
                }
                tokio::time::sleep(sleep_for).await;
            }
        }

        if waited {
            nowait_run = 0;
        } else {
            nowait_run += 1;
            if nowait_run > config.max_nowait {
                // Give the receiver a breather.
                tokio::time::sleep(config.waitfor).await;
                stats.forced_waits += 1;
                nowait_run = 0;
            }
        }

        match &mut rtp {
            Some(rtp) => {
                let mut datagram = bytes::BytesMut::with_capacity(12 + item.payload.len());
                let timestamp = (item.release.unwrap_or(last_release).base() & 0xFFFF_FFFF) as u32;
                rtp.write_to(&mut datagram, timestamp);
                datagram.extend_from_slice(&item.payload);
                sink.send(&datagram).await?;
            }
            None => sink.send(&item.payload).await?,
        }

        stats.items += 1;
        stats.bytes += item.payload.len() as u64;
    }

    Ok(stats)
}

/// Spawns the consumer as its own task.
pub fn spawn_consumer<S: DatagramSink + 'static>(
    buffer: Arc<PacingBuffer>,
    mut sink: S,
    config: PaceConfig,
) -> tokio::task::JoinHandle<Result<ConsumerStats>> {
    tokio::spawn(async move { run_consumer(buffer, &mut sink, &config).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct CollectorSink {
        datagrams: Vec<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl DatagramSink for CollectorSink {
        async fn send(&mut self, datagram: &[u8]) -> Result<()> {
            self.datagrams.push(datagram.to_vec());
            Ok(())
        }
    }

    fn test_config(mode: PcrMode) -> PaceConfig {
        PaceConfig {
            mode,
            byte_rate: 1_000_000,
            capacity: 64,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_drains_items_then_eos() {
        let config = test_config(PcrMode::None);
        let (mut sender, buffer) = PacedSender::new(config.clone());

        let n_packets = 35usize; // five full items
        for i in 0..n_packets {
            let mut packet = vec![0u8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            packet[4] = i as u8;
            sender.push_packet(&packet, None).await.unwrap();
        }
        sender.finish().await.unwrap();

        let mut sink = CollectorSink {
            datagrams: Vec::new(),
        };
        let stats = run_consumer(buffer, &mut sink, &config).await.unwrap();

        assert_eq!(stats.items, 5);
        assert_eq!(stats.bytes, (n_packets * TS_PACKET_SIZE) as u64);
        assert_eq!(sink.datagrams.len(), 5);
        // Packets keep source order across items.
        let mut seen = Vec::new();
        for datagram in &sink.datagrams {
            assert_eq!(datagram.len(), 7 * TS_PACKET_SIZE);
            for chunk in datagram.chunks(TS_PACKET_SIZE) {
                assert_eq!(chunk[0], 0x47);
                seen.push(chunk[4]);
            }
        }
        assert_eq!(seen, (0..n_packets as u8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_partial_item_is_flushed() {
        let config = test_config(PcrMode::None);
        let (mut sender, buffer) = PacedSender::new(config.clone());
        for _ in 0..10 {
            let mut packet = vec![0u8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            sender.push_packet(&packet, None).await.unwrap();
        }
        sender.finish().await.unwrap();

        let mut sink = CollectorSink {
            datagrams: Vec::new(),
        };
        let stats = run_consumer(buffer, &mut sink, &config).await.unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(sink.datagrams[1].len(), 3 * TS_PACKET_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn rtp_datagrams_carry_headers() {
        let config = PaceConfig {
            rtp: true,
            ..test_config(PcrMode::None)
        };
        let (mut sender, buffer) = PacedSender::new(config.clone());
        for _ in 0..7 {
            let mut packet = vec![0u8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            sender.push_packet(&packet, None).await.unwrap();
        }
        sender.finish().await.unwrap();

        let mut sink = CollectorSink {
            datagrams: Vec::new(),
        };
        run_consumer(buffer, &mut sink, &config).await.unwrap();
        let datagram = &sink.datagrams[0];
        assert_eq!(datagram.len(), 12 + 7 * TS_PACKET_SIZE);
        assert_eq!(datagram[0], 0x80);
        assert_eq!(datagram[1], 33); // MP2T
        assert_eq!(datagram[12], 0x47);
    }

    #[tokio::test(start_paused = true)]
    async fn mode2_paces_on_the_pcr_timeline() {
        let config = PaceConfig {
            packets_per_item: 1,
            capacity: 256, // all 101 single-packet items stage before pcr2
            ..test_config(PcrMode::Mode2DstTs)
        };
        let (mut sender, buffer) = PacedSender::new(config.clone());

        let producer = tokio::spawn(async move {
            // PCR at packet 0 and packet 100, one second apart at 27 MHz.
            for i in 0..101u64 {
                let mut packet = vec![0u8; TS_PACKET_SIZE];
                packet[0] = 0x47;
                let pcr = match i {
                    0 => Some(Pcr(27_000_000)),
                    100 => Some(Pcr(54_000_000)),
                    _ => None,
                };
                sender.push_packet(&packet, pcr).await.unwrap();
            }
            sender.finish().await.unwrap();
        });

        let mut sink = CollectorSink {
            datagrams: Vec::new(),
        };
        let started = Instant::now();
        let stats = run_consumer(buffer, &mut sink, &config).await.unwrap();
        producer.await.unwrap();

        assert_eq!(stats.items, 101);
        // The interpolated timeline spans one second; with paused time the
        // consumer slept it away virtually.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(900),
            "elapsed {:?}",
            elapsed
        );
    }
}
