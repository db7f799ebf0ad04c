//! # Packet Queues
//!
//! Pending outbound packets, split into a high-priority queue (streams
//! registered with [`PacketQueues::register_priority_stream`]) and a normal
//! queue. Both are ordered by [`PacketKey`], so each frame's packets form a
//! contiguous run and the oldest frame is always at the front.
//!
//! The priority queue is drained strictly first. Normal traffic can starve
//! under sustained priority load; audio is small enough that this is fine.

use bytes::Bytes;
use quanta::Instant;
use std::collections::{BTreeMap, HashSet};

use crate::history::SendHistory;
use crate::key::{PacketKey, PacketPurpose, QueuedPacket};

/// Normal and high-priority packet queues.
#[derive(Debug, Default)]
pub struct PacketQueues {
    priority: BTreeMap<PacketKey, QueuedPacket>,
    normal: BTreeMap<PacketKey, QueuedPacket>,
    priority_streams: HashSet<u32>,
}

impl PacketQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a stream as high priority for the lifetime of the queues.
    pub fn register_priority_stream(&mut self, stream_id: u32) {
        self.priority_streams.insert(stream_id);
    }

    pub fn is_high_priority(&self, key: &PacketKey) -> bool {
        self.priority_streams.contains(&key.stream_id)
    }

    /// Queue a batch of packets, replacing entries with the same key.
    ///
    /// Every packet of one batch must share the same priority class.
    /// Returns the number of packets inserted.
    pub fn enqueue<I>(&mut self, packets: I, purpose: PacketPurpose) -> usize
    where
        I: IntoIterator<Item = (PacketKey, Bytes)>,
    {
        let mut batch_priority = None;
        let mut count = 0;
        for (key, payload) in packets {
            let high = self.is_high_priority(&key);
            let expected = *batch_priority.get_or_insert(high);
            debug_assert_eq!(high, expected, "mixed priority batch at {key}");
            self.insert(key, QueuedPacket::new(purpose, payload));
            count += 1;
        }
        count
    }

    /// Queue a single packet into the priority queue regardless of stream.
    pub fn enqueue_priority(&mut self, key: PacketKey, packet: QueuedPacket) {
        self.priority.insert(key, packet);
    }

    fn insert(&mut self, key: PacketKey, packet: QueuedPacket) {
        if self.is_high_priority(&key) {
            self.priority.insert(key, packet);
        } else {
            self.normal.insert(key, packet);
        }
    }

    /// Drop a queued packet. Returns whether anything was removed.
    pub fn cancel(&mut self, key: &PacketKey) -> bool {
        let normal = self.normal.remove(key).is_some();
        let priority = self.priority.remove(key).is_some();
        normal || priority
    }

    /// Remove and return the next packet to transmit.
    ///
    /// Within the oldest frame of the chosen queue, a packet that was never
    /// sent wins outright. If every queued packet of the frame has been sent
    /// before, the one sent longest ago wins, so retransmissions rotate
    /// through the frame instead of hammering one packet.
    pub fn pop_next(&mut self, history: &SendHistory) -> Option<(PacketKey, QueuedPacket)> {
        debug_assert!(!self.is_empty(), "pop_next on empty queues");
        let list = if !self.priority.is_empty() {
            &mut self.priority
        } else {
            &mut self.normal
        };
        let key = select_in_frame(list, history)?;
        list.remove_entry(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    /// Total queued packets.
    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn contains(&self, key: &PacketKey) -> bool {
        self.priority.contains_key(key) || self.normal.contains_key(key)
    }
}

/// Merged walk over the first frame's queued keys and its send records.
///
/// History may hold records for packets no longer queued (sent and not
/// resent, or canceled), so the record cursor can skip ahead several
/// entries for one step of the queue cursor.
fn select_in_frame(
    list: &BTreeMap<PacketKey, QueuedPacket>,
    history: &SendHistory,
) -> Option<PacketKey> {
    let (&first, _) = list.iter().next()?;
    let mut records = history.frame_records(&first).peekable();
    let mut found = first;
    let mut earliest: Option<Instant> = None;

    for (&key, _) in list.range(first..=first.frame_end()) {
        while records.next_if(|(k, _)| **k < key).is_some() {}
        match records.peek() {
            Some((k, record)) if **k == key => {
                if earliest.map_or(true, |t| record.last_send_time < t) {
                    earliest = Some(record.last_send_time);
                    found = key;
                }
            }
            _ => return Some(key),
        }
    }
    Some(found)
}
