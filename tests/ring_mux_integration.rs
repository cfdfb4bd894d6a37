//! End-to-end tests crossing module boundaries: a stream's PAT/PMT/keyframe
//! traffic driving both the ring buffer's smart start and the MPTS mux's
//! service readiness, exercised the way a real ingest/mux pipeline would.

use tsrelay::config::{MuxConfig, SmartStartConfig, StreamConfig};
use tsrelay::mux::Mux;
use tsrelay::ring::{ReadOutcome, ReaderHandle, RingBuffer};
use tsrelay::ts::psi::{EsInfo, Section};
use tsrelay::ts::{PACKET_SIZE, SYNC_BYTE};

type Packet = [u8; PACKET_SIZE];

fn ts_packet(pid: u16, pusi: bool, af_random_access: bool, cc: u8) -> Packet {
    let mut p = [0u8; PACKET_SIZE];
    p[0] = SYNC_BYTE;
    p[1] = (if pusi { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1f);
    p[2] = pid as u8;
    if af_random_access {
        p[3] = 0x30 | (cc & 0x0f); // adaptation field + payload
        p[4] = 1; // adaptation_field_length
        p[5] = 0x40; // random_access_indicator
    } else {
        p[3] = 0x10 | (cc & 0x0f);
    }
    p
}

fn pat_packet(pmt_pid: u16) -> Packet {
    let mut p = [0u8; PACKET_SIZE];
    p[0] = SYNC_BYTE;
    p[1] = 0x40; // PUSI, PID high bits 0
    p[2] = 0x00; // PID 0x0000
    p[3] = 0x10;
    p[4] = 0; // pointer_field
    let section = Section::Pat { tsid: 1, version: 0, programs: vec![(1, pmt_pid)] }.encode();
    let section = &section[0];
    p[5..5 + section.len()].copy_from_slice(section);
    p
}

fn pmt_packet(pmt_pid: u16, pcr_pid: u16, video_pid: u16) -> Packet {
    let mut p = [0u8; PACKET_SIZE];
    p[0] = SYNC_BYTE;
    p[1] = 0x40 | ((pmt_pid >> 8) as u8 & 0x1f);
    p[2] = pmt_pid as u8;
    p[3] = 0x10;
    p[4] = 0;
    let section = Section::Pmt {
        program_number: 1,
        version: 0,
        pcr_pid,
        program_descriptors: vec![],
        streams: vec![EsInfo { stream_type: 0x1b, elementary_pid: video_pid, descriptors: vec![] }],
    }
    .encode();
    let section = &section[0];
    p[5..5 + section.len()].copy_from_slice(section);
    p
}

/// Scenario 1 (§8): a PAT-carrying, random-access-flagged stream should let
/// a joining client land on a checkpoint near the configured target delay,
/// with both PAT and keyframe requirements satisfied.
#[test]
fn smart_start_lands_on_qualifying_checkpoint_after_ring_traffic() {
    let cfg = StreamConfig {
        id: "s1".into(),
        bandwidth_kbps: 4_000,
        buffering_sec: 6,
        keyframe_detect_mode: tsrelay::config::KeyframeDetectMode::RandomAccess,
        smart_start: SmartStartConfig { target_delay_ms: 1500, ..Default::default() },
        ..Default::default()
    };
    let rb = RingBuffer::new(cfg);

    let pmt_pid = 0x100;
    let video_pid = 0x101;
    let mut cc = 0u8;

    // Ten seconds of 1s-GOP traffic: PAT+PMT right before each keyframe.
    for _ in 0..10 {
        rb.store_packet(&pat_packet(pmt_pid)).unwrap();
        rb.store_packet(&pmt_packet(pmt_pid, video_pid, video_pid)).unwrap();
        rb.store_packet(&ts_packet(video_pid, true, true, cc)).unwrap();
        cc = (cc + 1) & 0x0f;
        for _ in 0..24 {
            rb.store_packet(&ts_packet(video_pid, false, false, cc)).unwrap();
            cc = (cc + 1) & 0x0f;
        }
    }

    let reader = rb.acquire_reader();
    let debug = rb.last_start_debug().expect("smart start should record a debug entry");
    assert_eq!(debug.mode, tsrelay::ring::StartMode::SmartCheckpoint);
    assert!(reader.read_index <= rb.write_index());
    assert!(reader.read_index >= rb.write_index().saturating_sub(rb.capacity() as u64));
}

/// Scenario 2 (§8): input failover bumps the ring generation; an existing
/// reader observes the change on its next read and is re-anchored.
#[test]
fn input_failover_bumps_generation_and_reanchors_reader() {
    let cfg = StreamConfig { id: "s1".into(), ..Default::default() };
    let rb = RingBuffer::new(cfg);
    rb.store_packet(&ts_packet(0x100, false, false, 0)).unwrap();

    let mut reader = ReaderHandle { read_index: 0, generation: 0 };
    rb.resync(); // secondary input takes over
    rb.store_packet(&ts_packet(0x100, false, false, 1)).unwrap();

    match rb.read_next(&mut reader) {
        ReadOutcome::Resynced => {}
        other => panic!("expected Resynced on generation change, got {:?}", other),
    }
    assert_eq!(reader.generation, rb.generation());
    assert_eq!(reader.read_index, rb.write_index());
}

/// Scenario 3 (§8): two services colliding on the same input video PID get
/// distinct output PIDs from the mux's allocator, and both appear in the
/// regenerated PAT once their PMTs are ready.
#[test]
fn colliding_service_pids_get_distinct_output_assignment_and_reach_pat() {
    let mux = Mux::new(MuxConfig { si_interval_ms: 0, ..MuxConfig::default() });
    mux.register_service("a", None);
    mux.register_service("b", None);

    mux.ingest_input_pat("a", &Section::Pat { tsid: 1, version: 0, programs: vec![(1, 0x1000)] });
    mux.ingest_input_pat("b", &Section::Pat { tsid: 1, version: 0, programs: vec![(2, 0x1000)] });

    let pmt = |pcr_pid: u16, video_pid: u16| Section::Pmt {
        program_number: 1,
        version: 0,
        pcr_pid,
        program_descriptors: vec![],
        streams: vec![EsInfo { stream_type: 0x1b, elementary_pid: video_pid, descriptors: vec![] }],
    };
    mux.ingest_input_pmt("a", &pmt(0x100, 0x100)).unwrap();
    mux.ingest_input_pmt("b", &pmt(0x100, 0x100)).unwrap();

    assert_eq!(mux.ready_service_count(), 2);

    // Drive one packet per service through the packet plane; their video
    // PIDs must come out distinct even though both came in as 0x100.
    let mut pkt = [0u8; PACKET_SIZE];
    pkt[0] = SYNC_BYTE;
    pkt[1] = 0x01;
    pkt[2] = 0x00;
    pkt[3] = 0x10;
    let out_a = mux.process_packet("a", &pkt).unwrap();
    let out_b = mux.process_packet("b", &pkt).unwrap();
    assert_eq!(out_a.len(), 1);
    assert_eq!(out_b.len(), 1);
    let pid_a = (((out_a[0][1] & 0x1f) as u16) << 8) | out_a[0][2] as u16;
    let pid_b = (((out_b[0][1] & 0x1f) as u16) << 8) | out_b[0][2] as u16;
    assert_ne!(pid_a, pid_b);

    let si = mux.tick_si();
    let pat_pkt = si.iter().find(|p| p[1] & 0x1f == 0 && p[2] == 0).expect("a PAT packet was emitted");
    assert_eq!(pat_pkt[0], SYNC_BYTE);
}

/// PSI round-trip law (§8): encoding a PAT and parsing it back yields the
/// same program set and TSID.
#[test]
fn pat_round_trips_through_encode_and_parse() {
    let programs = vec![(1u16, 0x1000u16), (2, 0x1001)];
    let sections = Section::Pat { tsid: 7, version: 3, programs: programs.clone() }.encode();
    assert_eq!(sections.len(), 1);

    match Section::parse_pat(&sections[0]).unwrap() {
        Section::Pat { tsid, programs: parsed, .. } => {
            assert_eq!(tsid, 7);
            assert_eq!(parsed, programs);
        }
        other => panic!("expected Pat, got {:?}", other),
    }
}
