use super::types::{TsPacket, TS_PACKET_SIZE};
use crate::error::{Result, TsioError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Packets to verify at 188-byte strides before resynchronization succeeds.
const RESYNC_VERIFY_PACKETS: usize = 8;

/// Bytes to scan for a new sync raster before giving up.
const RESYNC_SCAN_BUDGET: usize = 64 * TS_PACKET_SIZE;

/// Scanner for 188-byte Transport Stream packets over any byte source.
///
/// The reader owns an internal read-ahead buffer, so the source itself may
/// be unbuffered. On a lost sync byte it scans forward one byte at a time
/// until [`RESYNC_VERIFY_PACKETS`] consecutive packets verify at 188-byte
/// strides, or fails with [`TsioError::Sync`].
pub struct TsReader<R> {
    source: R,
    buffer: BytesMut,
    /// Byte offset in the source of buffer\[0\]
    buffer_offset: u64,
    /// Packets handed out so far
    packets_read: u64,
    eof: bool,
    /// Packets with adaptation_field_control == 0 seen so far
    pub empty_packets: u64,
}

impl<R: AsyncRead + Unpin + Send> TsReader<R> {
    /// Creates a reader over `source`, positioned at its current offset.
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(RESYNC_SCAN_BUDGET),
            buffer_offset: 0,
            packets_read: 0,
            eof: false,
            empty_packets: 0,
        }
    }

    /// Byte offset of the next packet to be returned.
    pub fn position(&self) -> u64 {
        self.buffer_offset
    }

    /// Number of packets returned so far.
    pub fn packet_index(&self) -> u64 {
        self.packets_read
    }

    /// Ensures at least `want` bytes are buffered, or that EOF was reached.
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

    /// Discards `n` buffered bytes.
    fn consume(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
        self.buffer_offset += n as u64;
    }

    /// Verifies that the buffer holds sync bytes at 188-byte strides,
    /// starting at `from`, for as many whole packets as are buffered.
    fn strides_verify(&self, from: usize) -> bool {
        let mut checked = 0;
        let mut at = from;
        while checked < RESYNC_VERIFY_PACKETS {
            if at >= self.buffer.len() {
                // Cannot disprove with what is buffered; accept at EOF.
                return self.eof;
            }
            if self.buffer[at] != 0x47 {
                return false;
            }
            at += TS_PACKET_SIZE;
            checked += 1;
        }
        true
    }

    /// Scans forward for a verified 0x47 raster. Returns bytes skipped.
    async fn resync(&mut self) -> Result<usize> {
        let mut skipped = 0usize;
        loop {
            if skipped > RESYNC_SCAN_BUDGET {
                return Err(TsioError::Sync(format!(
                    "no sync byte found within {} bytes",
                    RESYNC_SCAN_BUDGET
                )));
            }
            self.fill(TS_PACKET_SIZE * RESYNC_VERIFY_PACKETS).await?;
            if self.buffer.is_empty() {
                return Err(TsioError::Sync("end of stream while resyncing".into()));
            }
            if self.buffer[0] == 0x47 && self.strides_verify(0) {
                return Ok(skipped);
            }
            self.consume(1);
            skipped += 1;
        }
    }

    /// Reads the next packet, resynchronizing if needed.
    ///
    /// Returns `None` at a clean end of stream. A short trailing read that is
    /// not on a packet boundary is an error.
    pub async fn read_next_packet(&mut self) -> Result<Option<TsPacket>> {
        self.fill(TS_PACKET_SIZE).await?;

        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer[0] != 0x47 {
            let skipped = self.resync().await?;
            log::warn!(
                "TS sync lost at offset {}: skipped {} bytes",
                self.buffer_offset - skipped as u64,
                skipped
            );
            self.fill(TS_PACKET_SIZE).await?;
        }

        if self.buffer.len() < TS_PACKET_SIZE {
            return Err(TsioError::Sync(format!(
                "{} trailing bytes at offset {} are not a whole packet",
                self.buffer.len(),
                self.buffer_offset
            )));
        }

        let offset = self.buffer_offset;
        let data: Bytes = self.buffer.split_to(TS_PACKET_SIZE).freeze();
        self.buffer_offset += TS_PACKET_SIZE as u64;

        if data[3] & 0x30 == 0 {
            // Neither payload nor adaptation field; tolerated but noted.
            self.empty_packets += 1;
            log::warn!(
                "TS packet at offset {} has no payload and no adaptation field",
                offset
            );
        }

        let index = self.packets_read;
        self.packets_read += 1;
        Ok(Some(TsPacket {
            data,
            offset,
            index,
        }))
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin + Send> TsReader<R> {
    /// Repositions the reader at an absolute byte offset in the source.
    pub async fn seek(&mut self, byte_offset: u64) -> Result<()> {
        self.source
            .seek(std::io::SeekFrom::Start(byte_offset))
            .await?;
        self.buffer.clear();
        self.buffer_offset = byte_offset;
        self.eof = false;
        Ok(())
    }

    /// Repositions the reader at packet `index`, assuming a packet-aligned
    /// source.
    pub async fn seek_to_packet(&mut self, index: u64) -> Result<()> {
        self.seek(index * TS_PACKET_SIZE as u64).await?;
        self.packets_read = index;
        Ok(())
    }
}
