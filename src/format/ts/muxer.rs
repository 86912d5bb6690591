use super::pes::PesPacket;
use super::types::*;
use crate::error::Result;
use crate::utils::clock::Pcr;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// Serializes PSI sections and PES packets into 188-byte TS packets.
///
/// Keeps a continuity counter per PID, splits long payloads across packets,
/// and pads the final packet of a PES with adaptation-field stuffing so the
/// payload length is preserved bit-exactly.
pub struct TsMuxer<W: AsyncWrite + Unpin + Send> {
    writer: BufWriter<W>,
    continuity: HashMap<u16, u8>,
    /// TS packets written
    pub packets_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> TsMuxer<W> {
    /// Creates a muxer over `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            continuity: HashMap::new(),
            packets_written: 0,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0x0F);
        *counter = (*counter + 1) & 0x0F;
        *counter
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
        self.writer.write_all(packet).await?;
        self.packets_written += 1;
        Ok(())
    }

    /// Writes one PSI section on `pid`, splitting across packets as needed.
    pub async fn write_section(&mut self, pid: u16, section: &[u8]) -> Result<()> {
        let mut remaining = section;
        let mut first = true;

        while first || !remaining.is_empty() {
            let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
            TsHeader {
                pid,
                payload_unit_start: first,
                continuity_counter: self.next_cc(pid),
                ..Default::default()
            }
            .write_to(&mut buf)?;

            if first {
                buf.put_u8(0); // pointer_field
                first = false;
            }

            let room = TS_PACKET_SIZE - buf.len();
            let take = room.min(remaining.len());
            buf.put_slice(&remaining[..take]);
            remaining = &remaining[take..];

            while buf.len() < TS_PACKET_SIZE {
                buf.put_u8(0xFF);
            }
            self.write_packet(&buf).await?;
        }
        Ok(())
    }

    /// Writes the PAT and PMT sections back to back.
    pub async fn write_psi(&mut self, pat: &Pat, pmt_pid: u16, pmt: &Pmt) -> Result<()> {
        let mut section = BytesMut::new();
        pat.write_section(&mut section)?;
        self.write_section(PID_PAT, &section).await?;

        let mut section = BytesMut::new();
        pmt.write_section(&mut section)?;
        self.write_section(pmt_pid, &section).await
    }

    /// Writes an adaptation-only packet carrying a PCR on `pid`.
    pub async fn write_pcr(&mut self, pid: u16, pcr: Pcr) -> Result<()> {
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        TsHeader {
            pid,
            has_adaptation_field: true,
            has_payload: false,
            // cc does not advance on packets without payload
            continuity_counter: *self.continuity.get(&pid).unwrap_or(&0x0F) & 0x0F,
            ..Default::default()
        }
        .write_to(&mut buf)?;
        buf.put_u8(183);
        buf.put_u8(0x10); // PCR flag
        buf.put_slice(&pcr.to_bytes());
        while buf.len() < TS_PACKET_SIZE {
            buf.put_u8(0xFF);
        }
        self.write_packet(&buf).await
    }

    /// Writes one PES packet as TS packets on `pes.pid`.
    ///
    /// The serialized PES (header plus payload) fills consecutive packets;
    /// the last packet is padded with an adaptation field so no payload byte
    /// is added or lost.
    pub async fn write_pes(&mut self, pes: &PesPacket) -> Result<()> {
        let mut serialized = BytesMut::with_capacity(pes.header.serialized_len() + pes.payload.len());
        let mut header = pes.header.clone();
        if header.packet_length != 0 {
            // Re-derive the on-wire length for the header we serialize.
            let after_length = header.serialized_len() - 6 + pes.payload.len();
            header.packet_length = after_length.try_into().unwrap_or(0);
        }
        header.write_to(&mut serialized)?;
        serialized.put_slice(&pes.payload);

        let mut remaining = &serialized[..];
        let mut first = true;

        while first || !remaining.is_empty() {
            let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
            let room = TS_PACKET_SIZE - TS_HEADER_SIZE;
            let pad = room.saturating_sub(remaining.len());

            TsHeader {
                pid: pes.pid,
                payload_unit_start: first,
                has_adaptation_field: pad > 0,
                continuity_counter: self.next_cc(pes.pid),
                ..Default::default()
            }
            .write_to(&mut buf)?;
            first = false;

            if pad > 0 {
                // Adaptation field of exactly `pad` bytes.
                buf.put_u8((pad - 1) as u8);
                if pad > 1 {
                    buf.put_u8(0x00); // no flags
                    for _ in 2..pad {
                        buf.put_u8(0xFF);
                    }
                }
            }

            let take = remaining.len().min(TS_PACKET_SIZE - buf.len());
            buf.put_slice(&remaining[..take]);
            remaining = &remaining[take..];
            debug_assert_eq!(buf.len(), TS_PACKET_SIZE);
            self.write_packet(&buf).await?;
        }
        Ok(())
    }

    /// Flushes buffered packets to the underlying writer.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub async fn into_inner(mut self) -> Result<W> {
        self.writer.flush().await?;
        Ok(self.writer.into_inner())
    }
}
