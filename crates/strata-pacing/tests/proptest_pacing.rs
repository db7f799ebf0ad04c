//! Property-based tests for pacer scheduling invariants.
//!
//! Priority ordering, burst smoothing, history bounds and cancel
//! idempotence over randomized workloads.

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Clock;
use std::collections::HashSet;
use std::time::Duration;
use strata_pacing::burst::BurstController;
use strata_pacing::events::synthetic_payload;
use strata_pacing::history::SendHistory;
use strata_pacing::queue::PacketQueues;
use strata_pacing::timer::TimerQueue;
use strata_pacing::{
    PacedSender, PacingConfig, PacketKey, PacketPurpose, PacketTransport, SendStatus, WakeHandle,
};

const AUDIO: u32 = 100;
const VIDEO: u32 = 200;

#[derive(Default)]
struct BlockOnceTransport {
    streams: Vec<u32>,
    bytes: u64,
    ready: Option<WakeHandle>,
}

impl PacketTransport for BlockOnceTransport {
    fn send_packet(&mut self, packet: Bytes, ready: WakeHandle) -> SendStatus {
        self.bytes += packet.len() as u64;
        self.streams
            .push(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]));
        if self.streams.len() == 1 {
            self.ready = Some(ready);
            SendStatus::Blocked
        } else {
            SendStatus::Sent
        }
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes
    }
}

/// (is_audio, frame id, packet count) per submitted batch.
fn workload() -> impl Strategy<Value = Vec<(bool, u32, u16)>> {
    prop::collection::vec((any::<bool>(), 0u32..50, 1u16..6), 1..30)
}

// ─── Priority Ordering ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn priority_packets_precede_normal(batches in workload()) {
        let (clock, mock) = Clock::mock();
        let timers = TimerQueue::new(clock.clone());
        let mut pacer = PacedSender::new(
            PacingConfig::default(),
            clock,
            BlockOnceTransport::default(),
            timers.clone(),
        );
        pacer.register_priority_stream(AUDIO);

        // Block the transport so everything below queues up.
        pacer.send_packets(vec![(
            PacketKey::new(1, VIDEO, 9_999, 0),
            synthetic_payload(VIDEO, 0, 0, 0, 64),
        )]);

        for (is_audio, frame_id, count) in batches {
            let stream = if is_audio { AUDIO } else { VIDEO };
            let batch = (0..count)
                .map(|id| {
                    (
                        PacketKey::new(1_000 + frame_id as u64 * 1_000, stream, frame_id, id),
                        synthetic_payload(stream, frame_id, id, count - 1, 64),
                    )
                })
                .collect();
            pacer.send_packets(batch);
        }
        let expected = pacer.len();

        if let Some(ready) = pacer.transport_mut().ready.take() {
            ready.wake();
        }
        pacer.run_pending_wakeups();
        for _ in 0..1_000 {
            if pacer.is_empty() {
                break;
            }
            mock.increment(Duration::from_millis(10));
            timers.fire_due();
            pacer.run_pending_wakeups();
        }

        let streams = &pacer.transport().streams[1..];
        prop_assert_eq!(streams.len(), expected);
        let first_video = streams.iter().position(|s| *s == VIDEO).unwrap_or(streams.len());
        prop_assert!(streams[first_video..].iter().all(|s| *s == VIDEO));
    }
}

// ─── Burst Smoothing ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn burst_quota_bounded_and_smoothed(
        target in 1usize..20,
        extra in 0usize..20,
        queued in prop::collection::vec(0usize..200, 1..40),
    ) {
        let config = PacingConfig {
            target_burst_size: target,
            max_burst_size: target + extra,
            ..PacingConfig::default()
        };
        let (clock, mock) = Clock::mock();
        let mut burst = BurstController::new(&config);
        let interval_target = |q: usize| {
            (q / config.max_bursts_per_frame)
                .max(config.target_burst_size)
                .min(config.max_burst_size)
        };

        let mut recent: Vec<usize> = Vec::new();
        for q in queued {
            burst.start_interval(clock.now(), q);
            let quota = burst.state().current_max_burst_size;
            prop_assert!(quota >= config.target_burst_size);
            prop_assert!(quota <= config.max_burst_size);

            recent.push(interval_target(q));
            // The quota covers this interval's target and the two before it.
            for t in recent.iter().rev().take(3) {
                prop_assert!(quota >= *t);
            }
            mock.increment(config.pacing_interval);
        }
    }
}

// ─── History Bound ───────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn history_within_capacity_after_rotation(
        capacity in 1usize..64,
        drains in prop::collection::vec(1usize..40, 1..50),
    ) {
        let (clock, mock) = Clock::mock();
        let mut history = SendHistory::new(capacity);
        let mut next_id: u32 = 0;

        for batch in drains {
            for _ in 0..batch {
                let key = PacketKey::new(next_id as u64, VIDEO, next_id / 8, (next_id % 8) as u16);
                history.record_send(key, clock.now(), 0, 0);
                next_id += 1;
            }
            if history.maybe_rotate() {
                prop_assert!(history.len() <= capacity);
                prop_assert_eq!(history.rollover_len(), 0);
            }
            prop_assert!(history.rollover_len() < capacity);
            mock.increment(Duration::from_millis(10));
        }
    }
}

// ─── Cancel Idempotence ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn cancel_is_idempotent(
        queued in prop::collection::btree_set(0u16..64, 0..40),
        cancels in prop::collection::vec(0u16..80, 0..60),
    ) {
        let key = |id: u16| PacketKey::new(5_000, VIDEO, 1, id);
        let mut queues = PacketQueues::new();
        queues.enqueue(
            queued.iter().map(|&id| (key(id), Bytes::from_static(b"payload"))),
            PacketPurpose::Normal,
        );

        let mut removed = HashSet::new();
        for id in &cancels {
            let was_removed = queues.cancel(&key(*id));
            prop_assert_eq!(was_removed, queued.contains(id) && removed.insert(*id));
            // Second cancel of the same key never removes anything.
            prop_assert!(!queues.cancel(&key(*id)));
        }

        prop_assert_eq!(queues.len(), queued.len() - removed.len());
        for id in &queued {
            prop_assert_eq!(queues.contains(&key(*id)), !removed.contains(id));
        }
    }
}
