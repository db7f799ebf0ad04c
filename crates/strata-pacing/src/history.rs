//! # Send History
//!
//! Two-generation ledger of recent transmissions, keyed by [`PacketKey`].
//!
//! Every send lands in both the `active` map (read by dedup and packet
//! selection) and the `rollover` map. Once the rollover map holds a full
//! dedup window's worth of keys, it is promoted to active and a fresh
//! rollover generation starts. Memory stays bounded at roughly two windows
//! while lookups always see at least one.

use quanta::Instant;
use std::collections::btree_map::{self, BTreeMap};
use std::time::Duration;

use crate::key::{DedupInfo, PacketKey};

// ─── SendRecord ──────────────────────────────────────────────────────────────

/// What we remember about the last transmission of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRecord {
    /// When the packet was last handed to the transport.
    pub last_send_time: Instant,
    /// Transport cumulative byte counter right after that send.
    pub bytes_sent_after_send: u64,
    /// Last known cumulative byte counter of the audio stream at that send.
    pub bytes_sent_for_audio_stream_after_send: u64,
    /// How many times the packet was canceled while queued.
    pub cancel_count: u32,
}

impl SendRecord {
    fn new(last_send_time: Instant) -> Self {
        SendRecord {
            last_send_time,
            bytes_sent_after_send: 0,
            bytes_sent_for_audio_stream_after_send: 0,
            cancel_count: 0,
        }
    }
}

// ─── SendHistory ─────────────────────────────────────────────────────────────

/// Time-windowed send ledger.
#[derive(Debug)]
pub struct SendHistory {
    active: BTreeMap<PacketKey, SendRecord>,
    rollover: BTreeMap<PacketKey, SendRecord>,
    /// Rollover size that triggers promotion.
    capacity: usize,
    rotations: u64,
}

impl SendHistory {
    pub fn new(capacity: usize) -> Self {
        SendHistory {
            active: BTreeMap::new(),
            rollover: BTreeMap::new(),
            capacity: capacity.max(1),
            rotations: 0,
        }
    }

    /// Record a transmission of `key` at `now`.
    ///
    /// Overwrites the send time and byte counters of an existing record but
    /// keeps its cancel count.
    pub fn record_send(
        &mut self,
        key: PacketKey,
        now: Instant,
        bytes_sent_after_send: u64,
        audio_bytes_after_send: u64,
    ) -> &mut SendRecord {
        let record = self
            .active
            .entry(key)
            .or_insert_with(|| SendRecord::new(now));
        record.last_send_time = now;
        record.bytes_sent_after_send = bytes_sent_after_send;
        record.bytes_sent_for_audio_stream_after_send = audio_bytes_after_send;
        self.rollover.insert(key, *record);
        record
    }

    /// Last send of `key`, if it is still inside the active window.
    pub fn lookup(&self, key: &PacketKey) -> Option<&SendRecord> {
        self.active.get(key)
    }

    /// Bump the cancel counter of an already-sent packet.
    ///
    /// Returns the new count, or `None` when the packet was never sent.
    pub fn cancel(&mut self, key: &PacketKey) -> Option<u32> {
        self.active.get_mut(key).map(|record| {
            record.cancel_count += 1;
            record.cancel_count
        })
    }

    /// Decide whether a retransmission request for `key` should go out.
    ///
    /// `video_stream` is the registered video stream id, if any.
    pub fn should_resend(
        &self,
        key: &PacketKey,
        dedup: &DedupInfo,
        now: Instant,
        video_stream: Option<u32>,
    ) -> bool {
        // Never sent, or sent so long ago it fell out of the window.
        let Some(record) = self.active.get(key) else {
            return true;
        };

        // Reject a video resend while the audio packet sent just before it
        // is still unacknowledged.
        // FIXME: audio always drains from the priority queue first, so the
        // premise of this check is doubtful. Kept until it can be measured.
        if video_stream == Some(key.stream_id)
            && dedup.last_byte_acked_for_audio != 0
            && record.bytes_sent_for_audio_stream_after_send != 0
            && dedup.last_byte_acked_for_audio < record.bytes_sent_for_audio_stream_after_send
        {
            return false;
        }

        now.saturating_duration_since(record.last_send_time) >= dedup.resend_interval
    }

    /// Promote the rollover generation once it has filled up.
    ///
    /// Returns `true` when a rotation happened.
    pub fn maybe_rotate(&mut self) -> bool {
        if self.rollover.len() < self.capacity {
            return false;
        }
        std::mem::swap(&mut self.active, &mut self.rollover);
        self.rollover.clear();
        // One drain can overshoot the capacity; the oldest keys go first.
        while self.active.len() > self.capacity {
            self.active.pop_first();
        }
        self.rotations += 1;
        true
    }

    /// Active records for the frame that `key` belongs to, in key order.
    pub(crate) fn frame_records(
        &self,
        key: &PacketKey,
    ) -> btree_map::Range<'_, PacketKey, SendRecord> {
        self.active.range(key.frame_start()..=key.frame_end())
    }

    /// Age of the last send of `key` relative to `now`.
    pub fn age(&self, key: &PacketKey, now: Instant) -> Option<Duration> {
        self.active
            .get(key)
            .map(|r| now.saturating_duration_since(r.last_send_time))
    }

    /// Number of records in the active generation.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of records in the rollover generation.
    pub fn rollover_len(&self) -> usize {
        self.rollover.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total rotations since creation.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}
