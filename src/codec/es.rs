use crate::error::Result;
use crate::format::ts::pes::is_video_stream_id;
use crate::format::PesSource;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A location in an elementary stream.
///
/// Two coordinates so that a byte can be named whether the ES came from a
/// raw file (`pkt_offset` 0) or from inside a reassembled PES packet
/// (`file_pos` of the packet, byte offset within its payload). Ordering is
/// lexicographic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EsOffset {
    /// Byte offset in the container source (or the raw ES file)
    pub file_pos: u64,
    /// Byte offset inside the PES payload; 0 for raw ES
    pub pkt_offset: u32,
}

impl EsOffset {
    /// Builds an offset from its two coordinates.
    pub fn new(file_pos: u64, pkt_offset: u32) -> Self {
        Self {
            file_pos,
            pkt_offset,
        }
    }
}

/// One start-code-delimited unit of elementary stream.
///
/// `data` always begins with `00 00 01 start_code` and runs up to (but not
/// including) the next start-code prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsUnit {
    /// The byte following the 00 00 01 prefix
    pub start_code: u8,
    /// Where the prefix began
    pub start: EsOffset,
    /// Prefix, start code and payload bytes
    pub data: Bytes,
}

enum EsSource {
    Pes(Box<dyn PesSource>),
    Raw(Box<dyn AsyncRead + Unpin + Send>),
}

/// Presents a single contiguous elementary stream byte sequence with an
/// [`EsOffset`] coordinate per byte.
///
/// Over a PES source only video-range stream_ids (0xE0..=0xEF) contribute;
/// other packets are skipped.
pub struct EsReader {
    source: EsSource,
    chunk: Bytes,
    chunk_pos: usize,
    /// file_pos of the current chunk
    chunk_file_pos: u64,
    /// True when chunk offsets are PES-payload-relative
    from_pes: bool,
    /// Running position for raw sources
    raw_pos: u64,
    eof: bool,
}

impl EsReader {
    /// Creates a reader over the video PES packets of `source`.
    pub fn from_pes(source: Box<dyn PesSource>) -> Self {
        Self {
            source: EsSource::Pes(source),
            chunk: Bytes::new(),
            chunk_pos: 0,
            chunk_file_pos: 0,
            from_pes: true,
            raw_pos: 0,
            eof: false,
        }
    }

    /// Creates a reader over a raw elementary stream.
    pub fn from_raw(reader: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        Self {
            source: EsSource::Raw(reader),
            chunk: Bytes::new(),
            chunk_pos: 0,
            chunk_file_pos: 0,
            from_pes: false,
            raw_pos: 0,
            eof: false,
        }
    }

    /// The offset the next byte will carry.
    pub fn position(&self) -> EsOffset {
        if self.from_pes {
            EsOffset::new(self.chunk_file_pos, self.chunk_pos as u32)
        } else {
            EsOffset::new(self.chunk_file_pos + self.chunk_pos as u64, 0)
        }
    }

    async fn refill(&mut self) -> Result<()> {
        match &mut self.source {
            EsSource::Pes(source) => loop {
                match source.next_pes_packet().await? {
                    Some(pes) => {
                        if !is_video_stream_id(pes.stream_id()) {
                            continue;
                        }
                        if pes.payload.is_empty() {
                            continue;
                        }
                        self.chunk_file_pos = pes.source_offset;
                        self.chunk = pes.payload;
                        self.chunk_pos = 0;
                        return Ok(());
                    }
                    None => {
                        self.eof = true;
                        return Ok(());
                    }
                }
            },
            EsSource::Raw(reader) => {
                let mut buf = vec![0u8; 8192];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    self.eof = true;
                } else {
                    buf.truncate(n);
                    self.chunk_file_pos = self.raw_pos;
                    self.raw_pos += n as u64;
                    self.chunk = Bytes::from(buf);
                    self.chunk_pos = 0;
                }
                Ok(())
            }
        }
    }

    /// The next byte and its offset, or `None` at end of stream.
    pub async fn next_byte(&mut self) -> Result<Option<(u8, EsOffset)>> {
        while self.chunk_pos >= self.chunk.len() {
            if self.eof {
                return Ok(None);
            }
            self.refill().await?;
        }
        let offset = self.position();
        let byte = self.chunk[self.chunk_pos];
        self.chunk_pos += 1;
        Ok(Some((byte, offset)))
    }
}

/// Splits an [`EsReader`]'s byte stream at `00 00 01` prefixes.
///
/// Keeps a three-byte rolling window; unit payload bytes are appended in
/// place, so there is no per-byte allocation. A truncated final unit (no
/// following start code before EOF) is still emitted.
pub struct StartCodeScanner {
    reader: EsReader,
    /// Unit being accumulated: data starts with 00 00 01 code
    pending: Option<PendingUnit>,
    /// Rolling (byte, offset) window of the last three bytes
    window: [(u8, EsOffset); 3],
    window_len: usize,
    /// Bytes before the first start code
    pub leading_garbage: u64,
    finished: bool,
}

struct PendingUnit {
    start_code: u8,
    start: EsOffset,
    data: BytesMut,
}

impl StartCodeScanner {
    /// Creates a scanner over `reader`.
    pub fn new(reader: EsReader) -> Self {
        Self {
            reader,
            pending: None,
            window: [(0, EsOffset::default()); 3],
            window_len: 0,
            leading_garbage: 0,
            finished: false,
        }
    }

    fn push_window(&mut self, byte: u8, offset: EsOffset) {
        self.window.rotate_left(1);
        self.window[2] = (byte, offset);
        if self.window_len < 3 {
            self.window_len += 1;
        }
    }

    fn window_is_prefix(&self) -> bool {
        self.window_len == 3
            && self.window[0].0 == 0
            && self.window[1].0 == 0
            && self.window[2].0 == 1
    }

    /// The next ES unit, or `None` after the final unit has been emitted.
    pub async fn next_unit(&mut self) -> Result<Option<EsUnit>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let Some((byte, offset)) = self.reader.next_byte().await? else {
                self.finished = true;
                // Truncated final unit.
                return Ok(self.pending.take().map(|p| EsUnit {
                    start_code: p.start_code,
                    start: p.start,
                    data: p.data.freeze(),
                }));
            };

            self.push_window(byte, offset);
            let is_prefix = self.window_is_prefix();

            match &mut self.pending {
                None => {
                    if is_prefix {
                        // The two zero bytes were counted as garbage before
                        // the prefix completed; they belong to the unit.
                        self.leading_garbage = self.leading_garbage.saturating_sub(2);
                        // The byte after the prefix is the start code.
                        let prefix_start = self.window[0].1;
                        let Some((code, _)) = self.reader.next_byte().await? else {
                            self.finished = true;
                            return Ok(None);
                        };
                        let mut data = BytesMut::with_capacity(256);
                        data.put_slice(&[0, 0, 1, code]);
                        self.pending = Some(PendingUnit {
                            start_code: code,
                            start: prefix_start,
                            data,
                        });
                        self.window_len = 0;
                    } else {
                        self.leading_garbage += 1;
                    }
                }
                Some(pending) => {
                    pending.data.put_u8(byte);
                    if is_prefix {
                        // The unit ends before this prefix.
                        let prefix_start = self.window[0].1;
                        let len = pending.data.len() - 3;
                        pending.data.truncate(len);
                        let unit = EsUnit {
                            start_code: pending.start_code,
                            start: pending.start,
                            data: pending.data.split().freeze(),
                        };

                        let Some((code, _)) = self.reader.next_byte().await? else {
                            self.finished = true;
                            self.pending = None;
                            return Ok(Some(unit));
                        };
                        let mut data = BytesMut::with_capacity(256);
                        data.put_slice(&[0, 0, 1, code]);
                        self.pending = Some(PendingUnit {
                            start_code: code,
                            start: prefix_start,
                            data,
                        });
                        self.window_len = 0;
                        return Ok(Some(unit));
                    }
                }
            }
        }
    }
}
