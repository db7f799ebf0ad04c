//! # Packet Identity
//!
//! Value types shared by the queues, the send history and the pacer.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

// ─── PacketKey ───────────────────────────────────────────────────────────────

/// Uniquely identifies one packet instance.
///
/// Field order matters: the derived ordering compares capture time first,
/// then stream, frame and packet id, so every packet of a frame sits in one
/// contiguous run of an ordered map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketKey {
    /// Media capture timestamp in microseconds. Control packets use 0.
    pub capture_time_us: u64,
    /// Opaque stream identifier (SSRC-equivalent).
    pub stream_id: u32,
    /// Frame this packet belongs to.
    pub frame_id: u32,
    /// Index of the packet within its frame.
    pub packet_id: u16,
}

impl PacketKey {
    pub fn new(capture_time_us: u64, stream_id: u32, frame_id: u32, packet_id: u16) -> Self {
        PacketKey {
            capture_time_us,
            stream_id,
            frame_id,
            packet_id,
        }
    }

    /// Key under which a control packet is queued while the transport is blocked.
    pub fn control(stream_id: u32) -> Self {
        PacketKey::new(0, stream_id, 0, 0)
    }

    /// Smallest key of this packet's frame.
    #[inline]
    pub fn frame_start(&self) -> Self {
        PacketKey {
            packet_id: 0,
            ..*self
        }
    }

    /// Largest key of this packet's frame.
    #[inline]
    pub fn frame_end(&self) -> Self {
        PacketKey {
            packet_id: u16::MAX,
            ..*self
        }
    }

    /// Whether both keys belong to the same frame.
    #[inline]
    pub fn same_frame(&self, other: &PacketKey) -> bool {
        self.capture_time_us == other.capture_time_us
            && self.stream_id == other.stream_id
            && self.frame_id == other.frame_id
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream={} frame={} packet={}",
            self.stream_id, self.frame_id, self.packet_id
        )
    }
}

// ─── Purpose ─────────────────────────────────────────────────────────────────

/// Why a packet sits in a queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketPurpose {
    /// First transmission.
    #[default]
    Normal,
    /// Retransmission requested by the receiver.
    Resend,
    /// Feedback/control packet (RTCP-class).
    Control,
}

// ─── QueuedPacket ────────────────────────────────────────────────────────────

/// A pending outbound packet, owned by whichever queue holds it.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub purpose: PacketPurpose,
    pub payload: Bytes,
}

impl QueuedPacket {
    pub fn new(purpose: PacketPurpose, payload: Bytes) -> Self {
        QueuedPacket { purpose, payload }
    }
}

/// A batch element handed to `send_packets` / `resend_packets`.
pub type PacketBatch = Vec<(PacketKey, Bytes)>;

// ─── DedupInfo ───────────────────────────────────────────────────────────────

/// Caller-supplied retransmission context, consumed once per resend call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupInfo {
    /// Minimum time between two transmissions of the same packet.
    pub resend_interval: Duration,
    /// Cumulative audio byte count acknowledged by the receiver (0 = unknown).
    pub last_byte_acked_for_audio: u64,
}

impl DedupInfo {
    pub fn new(resend_interval: Duration) -> Self {
        DedupInfo {
            resend_interval,
            last_byte_acked_for_audio: 0,
        }
    }

    pub fn with_audio_ack(mut self, last_byte_acked_for_audio: u64) -> Self {
        self.last_byte_acked_for_audio = last_byte_acked_for_audio;
        self
    }
}
