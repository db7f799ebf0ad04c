//! # Integration tests: pacer against a recording transport
//!
//! Drives the public API end to end on a mock clock. The "network" is a
//! transport that records every payload and can push back on chosen sends.
//! Payloads are RTP-shaped, so the stream and packet id of each send can be
//! read back from the recorded bytes.

use bytes::{Buf, Bytes};
use quanta::{Clock, Mock};
use std::sync::Arc;
use std::time::Duration;
use strata_pacing::events::{synthetic_payload, EventLog, MediaType};
use strata_pacing::timer::TimerQueue;
use strata_pacing::{
    DedupInfo, PacedSender, PacerState, PacingConfig, PacketBatch, PacketEventKind, PacketKey,
    PacketTransport, SendStatus, WakeHandle, Wakeup,
};

const AUDIO: u32 = 0x0A0A_0A0A;
const VIDEO: u32 = 0x0B0B_0B0B;

// ─── Helpers ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingTransport {
    sent: Vec<Bytes>,
    bytes: u64,
    /// 1-based send indices that report `Blocked`.
    block_on: Vec<usize>,
    ready: Vec<WakeHandle>,
}

impl RecordingTransport {
    /// (stream id, packet id) of every recorded send.
    fn sent_ids(&self) -> Vec<(u32, u16)> {
        self.sent
            .iter()
            .map(|p| {
                let mut buf = &p[8..];
                let stream = buf.get_u32();
                buf.advance(2);
                (stream, buf.get_u16())
            })
            .collect()
    }

    fn sent_packet_ids(&self) -> Vec<u16> {
        self.sent_ids().into_iter().map(|(_, id)| id).collect()
    }
}

impl PacketTransport for RecordingTransport {
    fn send_packet(&mut self, packet: Bytes, ready: WakeHandle) -> SendStatus {
        self.bytes += packet.len() as u64;
        self.sent.push(packet);
        if self.block_on.contains(&self.sent.len()) {
            self.ready.push(ready);
            SendStatus::Blocked
        } else {
            SendStatus::Sent
        }
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes
    }
}

struct Sim {
    pacer: PacedSender<RecordingTransport>,
    timers: TimerQueue,
    mock: Arc<Mock>,
    events: EventLog,
}

impl Sim {
    fn new(config: PacingConfig) -> Self {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock.clone());
        let events = EventLog::new();
        let mut pacer =
            PacedSender::new(config, clock, RecordingTransport::default(), timers.clone())
                .with_event_sink(events.clone());
        pacer.register_audio_stream(AUDIO);
        pacer.register_video_stream(VIDEO);
        pacer.register_priority_stream(AUDIO);
        Sim {
            pacer,
            timers,
            mock,
            events,
        }
    }

    fn advance(&mut self, by: Duration) {
        self.mock.increment(by);
        self.timers.fire_due();
        self.pacer.run_pending_wakeups();
    }

    fn transport(&self) -> &RecordingTransport {
        self.pacer.transport()
    }

    fn release_transport(&mut self) {
        let ready: Vec<WakeHandle> = self.pacer.transport_mut().ready.drain(..).collect();
        ready.into_iter().for_each(WakeHandle::wake);
        self.pacer.run_pending_wakeups();
    }
}

fn reference_config() -> PacingConfig {
    PacingConfig {
        target_burst_size: 10,
        max_burst_size: 20,
        ..PacingConfig::default()
    }
}

fn packet(stream: u32, frame: u32, id: u16, max_id: u16) -> (PacketKey, Bytes) {
    let capture_us = 10_000 + frame as u64 * 33_333;
    (
        PacketKey::new(capture_us, stream, frame, id),
        synthetic_payload(stream, frame * 3000, id, max_id, 120),
    )
}

fn frame(stream: u32, frame_id: u32, count: u16) -> PacketBatch {
    (0..count)
        .map(|id| packet(stream, frame_id, id, count - 1))
        .collect()
}

// ─── Reference Scenarios ────────────────────────────────────────────────────

#[test]
fn first_drive_sends_first_ten_in_order() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.send_packets(frame(VIDEO, 0, 30));

    assert_eq!(sim.transport().sent_packet_ids(), (0..10).collect::<Vec<u16>>());
    assert_eq!(sim.pacer.len(), 20);
    assert_eq!(sim.pacer.state(), PacerState::BurstFull);
}

#[test]
fn resend_deduplicated_by_recency() {
    let mut sim = Sim::new(reference_config());
    let batch = vec![packet(VIDEO, 0, 0, 0)];
    sim.pacer.send_packets(batch.clone());
    let dedup = DedupInfo::new(Duration::from_millis(100));

    sim.advance(Duration::from_millis(50));
    assert_eq!(sim.pacer.resend_packets(batch.clone(), &dedup), 0);
    assert_eq!(sim.transport().sent.len(), 1);

    sim.advance(Duration::from_millis(100));
    assert_eq!(sim.pacer.resend_packets(batch, &dedup), 1);
    assert_eq!(sim.transport().sent.len(), 2);

    let kinds: Vec<PacketEventKind> = sim.events.drain().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            PacketEventKind::SentToNetwork,
            PacketEventKind::RetransmissionRejected,
            PacketEventKind::Retransmitted,
        ]
    );
}

#[test]
fn transport_block_and_resume() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.transport_mut().block_on = vec![5];
    sim.pacer.send_packets(frame(VIDEO, 0, 10));

    assert_eq!(sim.pacer.len(), 5);
    assert_eq!(sim.pacer.state(), PacerState::TransportBlocked);
    assert_eq!(sim.transport().sent.len(), 5);

    sim.release_transport();
    assert_eq!(sim.transport().sent.len(), 10);
    assert_eq!(
        sim.transport().sent_packet_ids()[5..],
        [5u16, 6, 7, 8, 9]
    );
    assert!(sim.pacer.is_empty());
    assert_eq!(sim.pacer.state(), PacerState::Unblocked);
}

// ─── Selection ──────────────────────────────────────────────────────────────

#[test]
fn high_priority_drains_first() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.transport_mut().block_on = vec![1];
    sim.pacer.send_packets(frame(VIDEO, 0, 1));
    assert_eq!(sim.pacer.state(), PacerState::TransportBlocked);

    sim.pacer.send_packets(frame(VIDEO, 1, 3));
    sim.pacer.send_packets(vec![packet(AUDIO, 5, 0, 0)]);
    sim.pacer.send_packets(vec![packet(AUDIO, 6, 0, 0)]);

    sim.release_transport();
    let streams: Vec<u32> = sim.transport().sent_ids()[1..].iter().map(|(s, _)| *s).collect();
    assert_eq!(streams, vec![AUDIO, AUDIO, VIDEO, VIDEO, VIDEO]);
}

#[test]
fn retransmissions_rotate_through_frame() {
    let mut sim = Sim::new(reference_config());
    let batch = frame(VIDEO, 0, 3);

    // Send order 2, 0, 1, one millisecond apart.
    for idx in [2usize, 0, 1] {
        sim.pacer.send_packets(vec![batch[idx].clone()]);
        sim.advance(Duration::from_millis(1));
    }

    sim.pacer.resend_packets(batch, &DedupInfo::new(Duration::ZERO));
    assert_eq!(sim.transport().sent_packet_ids(), vec![2, 0, 1, 2, 0, 1]);
}

#[test]
fn unsent_packets_preferred_over_resends() {
    let mut sim = Sim::new(PacingConfig {
        target_burst_size: 2,
        max_burst_size: 2,
        ..PacingConfig::default()
    });
    let batch = frame(VIDEO, 0, 4);
    sim.pacer.send_packets(batch.clone());
    assert_eq!(sim.transport().sent_packet_ids(), vec![0, 1]);

    sim.pacer
        .resend_packets(vec![batch[0].clone()], &DedupInfo::new(Duration::ZERO));
    sim.advance(Duration::from_millis(10));
    sim.advance(Duration::from_millis(10));
    assert_eq!(sim.transport().sent_packet_ids(), vec![0, 1, 2, 3, 0]);
}

// ─── Control Packets ────────────────────────────────────────────────────────

#[test]
fn control_packet_waits_out_backpressure() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.transport_mut().block_on = vec![2];
    sim.pacer.send_packets(frame(VIDEO, 0, 4));
    assert_eq!(sim.pacer.state(), PacerState::TransportBlocked);

    let rtcp = synthetic_payload(VIDEO, 0, 0xFFFF, 0xFFFF, 40);
    sim.pacer.send_control_packet(VIDEO, rtcp.clone());
    assert_eq!(sim.transport().sent.len(), 2);

    sim.release_transport();
    assert_eq!(sim.transport().sent[2], rtcp);
    assert_eq!(sim.transport().sent.len(), 5);
    // Control packets never reach the event sink.
    assert_eq!(sim.events.len(), 4);
}

// ─── Cancel ─────────────────────────────────────────────────────────────────

#[test]
fn canceled_packets_never_sent() {
    let mut sim = Sim::new(reference_config());
    let batch = frame(VIDEO, 0, 12);
    sim.pacer.send_packets(batch.clone());
    for (key, _) in &batch[10..] {
        sim.pacer.cancel_sending_packet(key);
    }
    assert!(sim.pacer.is_empty());

    sim.advance(Duration::from_millis(10));
    assert_eq!(sim.transport().sent.len(), 10);
    assert_eq!(sim.pacer.stats().packets_canceled, 2);
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[test]
fn events_carry_expanded_rtp_timestamps() {
    let mut sim = Sim::new(reference_config());
    let near_wrap = u32::MAX - 100;
    let key_a = PacketKey::new(1_000, AUDIO, 0, 0);
    let key_b = PacketKey::new(21_000, AUDIO, 1, 0);
    sim.pacer
        .send_packets(vec![(key_a, synthetic_payload(AUDIO, near_wrap, 0, 0, 60))]);
    sim.pacer
        .send_packets(vec![(key_b, synthetic_payload(AUDIO, 860, 0, 0, 60))]);

    let events = sim.events.drain();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.media_type == MediaType::Audio));
    assert_eq!(events[0].rtp_timestamp, near_wrap as u64);
    assert_eq!(events[1].rtp_timestamp, (1u64 << 32) + 860);
    assert_eq!(events[1].size, 60);
}

#[test]
fn unknown_streams_are_sent_but_not_logged() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.send_packets(frame(0xCAFE, 0, 3));
    assert_eq!(sim.transport().sent.len(), 3);
    assert!(sim.events.is_empty());
}

// ─── History ────────────────────────────────────────────────────────────────

#[test]
fn history_stays_bounded() {
    let config = PacingConfig {
        dedup_window: Duration::from_millis(50),
        ..reference_config()
    };
    let capacity = config.history_capacity();
    let mut sim = Sim::new(config);

    let mut rotations = 0;
    for frame_id in 0..100 {
        sim.pacer.send_packets(frame(VIDEO, frame_id, 8));
        if sim.pacer.stats().history_rotations > rotations {
            rotations = sim.pacer.stats().history_rotations;
            assert!(sim.pacer.history().len() <= capacity);
        }
        assert!(sim.pacer.history().len() <= 2 * capacity + 8);
        sim.advance(Duration::from_millis(10));
    }
    assert!(rotations > 0);
    assert_eq!(sim.transport().sent.len(), 800);
}

// ─── Wakeups Across Threads ─────────────────────────────────────────────────

#[test]
fn ready_wakeup_from_another_thread() {
    let mut sim = Sim::new(reference_config());
    sim.pacer.transport_mut().block_on = vec![1];
    sim.pacer.send_packets(frame(VIDEO, 0, 3));
    let ready = sim.pacer.transport_mut().ready.pop().unwrap();

    std::thread::spawn(move || ready.wake()).join().unwrap();

    let wakeup = sim
        .pacer
        .wakeups()
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(wakeup, Wakeup::TransportReady);
    sim.pacer.handle_wakeup(wakeup);
    assert_eq!(sim.transport().sent.len(), 3);
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[test]
fn toml_config_shapes_bursts() {
    let config = PacingConfig::from_toml_str(
        r#"
        pacing_interval_ms = 20
        target_burst_size = 4
        max_burst_size = 6
        "#,
    )
    .unwrap();
    let mut sim = Sim::new(config);
    sim.pacer.send_packets(frame(VIDEO, 0, 9));
    assert_eq!(sim.transport().sent.len(), 4);

    sim.advance(Duration::from_millis(10));
    assert_eq!(sim.transport().sent.len(), 4);
    sim.advance(Duration::from_millis(10));
    assert_eq!(sim.transport().sent.len(), 8);
}
