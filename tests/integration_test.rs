//! End-to-end tests across the layered reader stack, the analyzer and the
//! paced output engine.

use bytes::{BufMut, BytesMut};
use pretty_assertions::assert_eq;
use std::io::Cursor;
use tsio::codec::es::EsReader;
use tsio::codec::h262::{H262Item, H262PictureBuilder};
use tsio::codec::StartCodeScanner;
use tsio::format::ts::{
    AnalyzerConfig, DemuxConfig, Pat, PatEntry, PesHeader, Pmt, StreamAnalyzer, StreamEntry,
    TsDemuxer, TsHeader, TsMuxer, TsPacket, TsReader, STREAM_TYPE_H262, STREAM_TYPE_MPEG2_AUDIO,
    TS_PACKET_SIZE,
};
use tsio::pace::{run_consumer, DatagramSink, PaceConfig, PacedSender, PcrMode};
use tsio::utils::clock::Pcr;
use tsio::Result;

fn raw_packet(pid: u16, cc: u8, pcr: Option<Pcr>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
    TsHeader {
        pid,
        continuity_counter: cc,
        has_adaptation_field: pcr.is_some(),
        ..Default::default()
    }
    .write_to(&mut buf)
    .unwrap();
    if let Some(pcr) = pcr {
        buf.put_u8(7);
        buf.put_u8(0x10);
        buf.put_slice(&pcr.to_bytes());
    }
    while buf.len() < TS_PACKET_SIZE {
        buf.put_u8(0xAA);
    }
    buf.to_vec()
}

fn sample_tables() -> (Pat, Pmt) {
    let pat = Pat {
        transport_stream_id: 1,
        version: 0,
        current_next: true,
        entries: vec![PatEntry {
            program_number: 1,
            pid: 0x1000,
        }],
    };
    let pmt = Pmt {
        program_number: 1,
        version: 0,
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
                descriptors: Vec::new(),
            },
        ],
    };
    (pat, pmt)
}

/// Scenario: four garbage octets, then five valid packets. The reader
/// resynchronizes and returns exactly the five packets.
#[tokio::test]
async fn sync_recovery_skips_garbage_prefix() {
    let mut data = vec![0xAB, 0xCD, 0xEF, 0x01];
    for cc in 0..5u8 {
        data.extend_from_slice(&raw_packet(0x100, cc, None));
    }

    let mut reader = TsReader::new(Cursor::new(data));
    let mut packets = Vec::new();
    while let Some(packet) = reader.read_next_packet().await.unwrap() {
        packets.push(packet);
    }

    assert_eq!(packets.len(), 5);
    assert_eq!(packets[0].offset, 4);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.data[0], 0x47);
        assert_eq!(packet.pid(), 0x100);
        assert_eq!(packet.continuity_counter(), i as u8);
    }
}

/// Scenario: PAT at packet 7 maps program 1 to PMT pid 0x1000; the PMT
/// declares H.262 video on 0x100 and MPEG-2 audio on 0x101.
#[tokio::test]
async fn pat_pmt_discovery_selects_program_pids() {
    let (pat, pmt) = sample_tables();
    // Leading unrelated traffic so the tables are not the first packets.
    let mut head = Vec::new();
    for cc in 0..7u8 {
        head.extend_from_slice(&raw_packet(0x300, cc, None));
    }
    let mut body = TsMuxer::new(head);
    body.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    body.write_pes(&pes_packet(0x100, 0xE0, Some(90_000), b"vid".to_vec()))
        .await
        .unwrap();
    body.write_pes(&pes_packet(0x101, 0xC0, Some(90_000), b"aud".to_vec()))
        .await
        .unwrap();
    let stream = body.into_inner().await.unwrap();

    let config = DemuxConfig {
        program_number: Some(1),
        ..Default::default()
    };
    let mut demux = TsDemuxer::new(TsReader::new(Cursor::new(stream.clone())), config);
    let mut pids = Vec::new();
    while let Some(pes) = demux.next_pes_packet().await.unwrap() {
        pids.push(pes.pid);
    }
    assert_eq!(demux.video_pid(), Some(0x100));
    assert_eq!(demux.audio_pid(), Some(0x101));
    assert!(pids.contains(&0x100) && pids.contains(&0x101));

    // Video-only mode ignores the audio PID entirely.
    let config = DemuxConfig {
        program_number: Some(1),
        video_only: true,
        ..Default::default()
    };
    let mut demux = TsDemuxer::new(TsReader::new(Cursor::new(stream)), config);
    let mut pids = Vec::new();
    while let Some(pes) = demux.next_pes_packet().await.unwrap() {
        pids.push(pes.pid);
    }
    assert!(pids.iter().all(|&pid| pid == 0x100));
    assert_eq!(demux.audio_pid(), None);
}

fn pes_packet(
    pid: u16,
    stream_id: u8,
    pts: Option<u64>,
    payload: Vec<u8>,
) -> tsio::format::ts::PesPacket {
    let mut header = PesHeader {
        stream_id,
        pts,
        ..Default::default()
    };
    header.packet_length = (header.serialized_len() - 6 + payload.len()) as u16;
    tsio::format::ts::PesPacket {
        pid,
        header,
        payload: payload.into(),
        source_offset: 0,
        source_index: 0,
    }
}

/// Scenario: two PCRs one second apart, 100 packets between them. Mode2
/// release times increase strictly; the item holding packet 50 releases at
/// 40 500 000 within one item's worth.
#[tokio::test]
async fn pcr_linear_interpolation_between_two_pcrs() {
    let config = PaceConfig {
        mode: PcrMode::Mode2DstTs,
        packets_per_item: 7,
        capacity: 256,
        ..Default::default()
    };
    let (mut sender, buffer) = PacedSender::new(config);

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

    let mut releases = Vec::new();
    let mut packet_index = 0usize;
    let mut midpoint_release = None;
    while let Some(item) = buffer.next_item().await.unwrap() {
        if item.eos {
            break;
        }
        if let Some(release) = item.release {
            releases.push(release.0);
            if (packet_index..packet_index + item.n_packets).contains(&50) {
                midpoint_release = Some(release.0);
            }
        }
        packet_index += item.n_packets;
    }

    for pair in releases.windows(2) {
        assert!(pair[1] > pair[0], "releases must be strictly increasing");
    }
    let one_item = 7 * 188 * 27_000_000u64 / 18_800;
    let midpoint = midpoint_release.expect("item containing packet 50");
    assert!(
        midpoint.abs_diff(40_500_000) <= one_item,
        "midpoint release {} not within {} of 40.5e6",
        midpoint,
        one_item
    );
}

/// Scenario: two packets identical except for the PCR field, then the
/// successor counter. One tolerated duplicate, no errors.
#[tokio::test]
async fn continuity_counter_duplicate_tolerance() {
    let mut analyzer = StreamAnalyzer::new(AnalyzerConfig::default());
    let first = raw_packet(0x100, 3, Some(Pcr(27_000_000)));
    let second = raw_packet(0x100, 3, Some(Pcr(27_009_000)));
    let third = raw_packet(0x100, 4, None);

    for (index, data) in [first, second, third].into_iter().enumerate() {
        analyzer.push_packet(&TsPacket {
            data: data.into(),
            offset: index as u64 * TS_PACKET_SIZE as u64,
            index: index as u64,
        });
    }

    let report = analyzer.report();
    let stats = &report.pids[&0x100];
    assert_eq!(stats.cc_errors, 0);
    assert_eq!(stats.duplicate_errors, 0);
    assert_eq!(stats.duplicate_packets, 1);
}

fn h262_field_picture(temporal_reference: u16, top: bool) -> Vec<u8> {
    let mut data = Vec::new();
    // picture header: 10-bit TR, type I, vbv_delay
    let word: u32 = (u32::from(temporal_reference) << 22) | (1 << 19) | (0xFFFF << 3);
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
    data.extend_from_slice(&word.to_be_bytes());
    // picture coding extension with picture_structure
    let structure: u32 = if top { 0b01 } else { 0b10 };
    let ext: u32 = (8 << 28) | (0xFFFF << 12) | (structure << 8);
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB5]);
    data.extend_from_slice(&ext.to_be_bytes());
    data.push(0x00);
    // one slice
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0xEE, 0xEE]);
    data
}

/// Scenario: top/bottom fields with temporal references 7,7,8,8 merge into
/// two frames carrying all units of both fields.
#[tokio::test]
async fn h262_field_pairing_merges_frames() {
    let mut es = Vec::new();
    es.extend_from_slice(&h262_field_picture(7, true));
    es.extend_from_slice(&h262_field_picture(7, false));
    es.extend_from_slice(&h262_field_picture(8, true));
    es.extend_from_slice(&h262_field_picture(8, false));

    let scanner = StartCodeScanner::new(EsReader::from_raw(Box::new(Cursor::new(es))));
    let mut builder = H262PictureBuilder::new(scanner);

    for expected in [7u16, 8] {
        let H262Item::Picture(frame) = builder.next_frame().await.unwrap().unwrap() else {
            panic!("expected a picture");
        };
        assert!(frame.was_merged);
        assert_eq!(frame.temporal_reference, expected);
        assert_eq!(frame.units.len(), 6);
    }
    assert!(builder.next_frame().await.unwrap().is_none());
}

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

/// Scenario: N items then EOS. The consumer drains exactly N items in
/// order and the bytes written equal the sum of the item lengths.
#[tokio::test(start_paused = true)]
async fn eos_propagation_drains_everything() {
    let config = PaceConfig {
        mode: PcrMode::None,
        byte_rate: 10_000_000,
        ..Default::default()
    };
    let (mut sender, buffer) = PacedSender::new(config.clone());

    let n_packets = 9 * 7;
    for i in 0..n_packets {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[7] = (i % 251) as u8;
        sender.push_packet(&packet, None).await.unwrap();
    }
    sender.finish().await.unwrap();

    let mut sink = CollectorSink {
        datagrams: Vec::new(),
    };
    let stats = run_consumer(buffer, &mut sink, &config).await.unwrap();

    assert_eq!(stats.items, 9);
    assert_eq!(stats.bytes, (n_packets * TS_PACKET_SIZE) as u64);
    let total: usize = sink.datagrams.iter().map(|d| d.len()).sum();
    assert_eq!(total, n_packets * TS_PACKET_SIZE);
    let mut sequence = Vec::new();
    for datagram in &sink.datagrams {
        for chunk in datagram.chunks(TS_PACKET_SIZE) {
            sequence.push(chunk[7]);
        }
    }
    assert_eq!(
        sequence,
        (0..n_packets).map(|i| (i % 251) as u8).collect::<Vec<_>>()
    );
}

/// Round trip: TS -> PES -> TS preserves the chosen program's PES payloads
/// byte for byte.
#[tokio::test]
async fn ts_pes_ts_round_trip_preserves_payloads() {
    let (pat, pmt) = sample_tables();
    let payloads: Vec<Vec<u8>> = vec![
        (0..200u16).map(|v| (v % 256) as u8).collect(),
        vec![0x11; 500],
        vec![0x22; 64],
    ];

    let mut muxer = TsMuxer::new(Vec::new());
    muxer.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    for (i, payload) in payloads.iter().enumerate() {
        muxer
            .write_pes(&pes_packet(
                0x100,
                0xE0,
                Some(90_000 * (i as u64 + 1)),
                payload.clone(),
            ))
            .await
            .unwrap();
    }
    let first_generation = muxer.into_inner().await.unwrap();

    // Demux and re-mux.
    let mut demux = TsDemuxer::new(
        TsReader::new(Cursor::new(first_generation)),
        DemuxConfig::default(),
    );
    let mut remux = TsMuxer::new(Vec::new());
    remux.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    while let Some(pes) = demux.next_pes_packet().await.unwrap() {
        remux.write_pes(&pes).await.unwrap();
    }
    let second_generation = remux.into_inner().await.unwrap();

    // Demux the re-muxed stream and compare payloads.
    let mut demux = TsDemuxer::new(
        TsReader::new(Cursor::new(second_generation)),
        DemuxConfig::default(),
    );
    let mut seen = Vec::new();
    while let Some(pes) = demux.next_pes_packet().await.unwrap() {
        seen.push(pes.payload.to_vec());
    }
    assert_eq!(seen, payloads);
}

/// Round trip: H.262 pictures written back as ES re-read to the same unit
/// byte vectors.
#[tokio::test]
async fn h262_picture_es_round_trip() {
    let mut es = Vec::new();
    es.extend_from_slice(&h262_field_picture(3, true));
    es.extend_from_slice(&h262_field_picture(3, false));
    es.extend_from_slice(&h262_field_picture(4, true));
    es.extend_from_slice(&h262_field_picture(4, false));

    let scanner = StartCodeScanner::new(EsReader::from_raw(Box::new(Cursor::new(es))));
    let mut builder = H262PictureBuilder::new(scanner);

    let mut first_units: Vec<Vec<u8>> = Vec::new();
    let mut rewritten = Vec::new();
    while let Some(item) = builder.next_frame().await.unwrap() {
        for unit in item.units() {
            first_units.push(unit.data.to_vec());
            rewritten.extend_from_slice(&unit.data);
        }
    }

    let scanner = StartCodeScanner::new(EsReader::from_raw(Box::new(Cursor::new(rewritten))));
    let mut builder = H262PictureBuilder::new(scanner);
    let mut second_units: Vec<Vec<u8>> = Vec::new();
    while let Some(item) = builder.next_frame().await.unwrap() {
        for unit in item.units() {
            second_units.push(unit.data.to_vec());
        }
    }

    assert_eq!(first_units, second_units);
}

/// Full pipeline: TS container -> PES -> ES -> H.262 frames.
#[tokio::test]
async fn full_pipeline_ts_to_h262_frames() {
    let (pat, pmt) = sample_tables();
    let mut es = Vec::new();
    es.extend_from_slice(&h262_field_picture(1, true));
    es.extend_from_slice(&h262_field_picture(1, false));

    let mut muxer = TsMuxer::new(Vec::new());
    muxer.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    muxer
        .write_pes(&pes_packet(0x100, 0xE0, Some(90_000), es))
        .await
        .unwrap();
    let stream = muxer.into_inner().await.unwrap();

    let demux = TsDemuxer::new(TsReader::new(Cursor::new(stream)), DemuxConfig::default());
    let scanner = StartCodeScanner::new(EsReader::from_pes(Box::new(demux)));
    let mut builder = H262PictureBuilder::new(scanner);

    let H262Item::Picture(frame) = builder.next_frame().await.unwrap().unwrap() else {
        panic!("expected a picture");
    };
    assert!(frame.was_merged);
    assert_eq!(frame.temporal_reference, 1);
}

/// Mirror mode re-emits everything the demuxer yields, PSI included, and a
/// second demux over the mirror output sees identical payloads.
#[tokio::test]
async fn mirror_mode_reemits_program() {
    let (pat, pmt) = sample_tables();
    let payloads: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 150 + i * 10]).collect();

    let mut muxer = TsMuxer::new(Vec::new());
    muxer.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    for (i, payload) in payloads.iter().enumerate() {
        muxer
            .write_pes(&pes_packet(
                0x100,
                0xE0,
                Some(90_000 * (i as u64 + 1)),
                payload.clone(),
            ))
            .await
            .unwrap();
    }
    let stream = muxer.into_inner().await.unwrap();

    let (tx, rx) = tokio::io::duplex(1 << 20);
    let mut demux = TsDemuxer::new(
        TsReader::new(Cursor::new(stream)),
        DemuxConfig {
            mirror_psi_interval: 2,
            ..Default::default()
        },
    )
    .with_mirror(Box::new(tx));
    while demux.next_pes_packet().await.unwrap().is_some() {}
    drop(demux);

    let mut mirrored = TsDemuxer::new(TsReader::new(rx), DemuxConfig::default());
    let mut seen = Vec::new();
    while let Some(pes) = mirrored.next_pes_packet().await.unwrap() {
        seen.push(pes.payload.to_vec());
    }
    assert_eq!(seen, payloads);
}

/// The analyzer survives an arbitrary generated stream and reports totals.
#[tokio::test]
async fn analyzer_reports_totals_over_generated_stream() {
    let (pat, pmt) = sample_tables();
    let mut muxer = TsMuxer::new(Vec::new());
    muxer.write_psi(&pat, 0x1000, &pmt).await.unwrap();
    for i in 0..20u64 {
        muxer
            .write_pes(&pes_packet(
                0x100,
                0xE0,
                Some(90_000 + i * 3_600),
                vec![0x55; 300],
            ))
            .await
            .unwrap();
    }
    let stream = muxer.into_inner().await.unwrap();

    let mut analyzer = StreamAnalyzer::new(AnalyzerConfig::default());
    let mut reader = TsReader::new(Cursor::new(stream));
    while let Some(packet) = reader.read_next_packet().await.unwrap() {
        analyzer.push_packet(&packet);
    }
    let report = analyzer.report();

    let video = &report.pids[&0x100];
    assert_eq!(video.stream_type, Some(STREAM_TYPE_H262));
    assert_eq!(video.cc_errors, 0);
    assert_eq!(video.first_pts, Some(90_000));
    assert_eq!(video.last_pts, Some(90_000 + 19 * 3_600));
    assert!(report.packets_scanned > 40);
}
