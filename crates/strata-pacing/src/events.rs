//! # Packet Lifecycle Events
//!
//! Turns sends, retransmissions and rejected retransmissions into
//! [`PacketEvent`]s for an external telemetry sink.
//!
//! Only a handful of fixed-offset RTP header fields are read, just enough to
//! tell audio from video and to attach a full 64-bit RTP timestamp:
//!
//! ```text
//! offset  0..4   V/P/X/CC, M/PT, sequence number (skipped)
//! offset  4..8   RTP timestamp, truncated to 32 bits
//! offset  8..12  SSRC (stream id)
//! offset 12..14  skipped
//! offset 14..16  packet id within frame
//! offset 16..18  max packet id of frame
//! ```
//!
//! Logging is best effort: a payload that cannot be parsed is dropped here
//! and never affects the send path.

use bytes::Buf;
use quanta::Instant;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Bytes needed to read every logged field.
pub const LOGGED_HEADER_LEN: usize = 18;

const RTP_WRAP: u64 = 1 << 32;

// ─── Event Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PacketEventKind {
    SentToNetwork,
    Retransmitted,
    RetransmissionRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaType {
    Audio,
    Video,
}

/// One packet lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub timestamp: Instant,
    pub kind: PacketEventKind,
    pub media_type: MediaType,
    /// RTP timestamp expanded to 64 bits.
    pub rtp_timestamp: u64,
    pub packet_id: u16,
    pub max_packet_id: u16,
    /// Full payload size in bytes.
    pub size: u32,
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Destination for packet lifecycle events.
pub trait PacketEventSink {
    fn record_packet_event(&mut self, event: PacketEvent);
}

impl PacketEventSink for Vec<PacketEvent> {
    fn record_packet_event(&mut self, event: PacketEvent) {
        self.push(event);
    }
}

impl PacketEventSink for crossbeam_channel::Sender<PacketEvent> {
    fn record_packet_event(&mut self, event: PacketEvent) {
        // Receiver gone: nobody is listening anymore.
        let _ = self.send(event);
    }
}

impl<S: PacketEventSink + ?Sized> PacketEventSink for Box<S> {
    fn record_packet_event(&mut self, event: PacketEvent) {
        (**self).record_packet_event(event);
    }
}

/// Shared, cloneable event buffer.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<PacketEvent>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every event recorded so far.
    pub fn drain(&self) -> Vec<PacketEvent> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketEventSink for EventLog {
    fn record_packet_event(&mut self, event: PacketEvent) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

// ─── Timestamp Expansion ─────────────────────────────────────────────────────

/// Expand a truncated 32-bit RTP timestamp against the previous full value.
///
/// Picks whichever of the candidates one wrap below, at, or above `last`'s
/// epoch lies closest to `last`.
pub fn expand_rtp_timestamp(last: u64, truncated: u32) -> u64 {
    let candidate = (last & !(RTP_WRAP - 1)) | truncated as u64;
    if candidate > last && candidate - last > RTP_WRAP / 2 && candidate >= RTP_WRAP {
        candidate - RTP_WRAP
    } else if candidate < last && last - candidate > RTP_WRAP / 2 {
        candidate + RTP_WRAP
    } else {
        candidate
    }
}

// ─── Logger ──────────────────────────────────────────────────────────────────

/// Registered audio/video stream ids used for classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStreams {
    pub audio: Option<u32>,
    pub video: Option<u32>,
}

/// Fields read from a logged packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoggedHeader {
    rtp_timestamp: u32,
    stream_id: u32,
    packet_id: u16,
    max_packet_id: u16,
}

fn parse_logged_header(mut buf: &[u8]) -> Option<LoggedHeader> {
    if buf.remaining() < LOGGED_HEADER_LEN {
        return None;
    }
    buf.advance(4);
    let rtp_timestamp = buf.get_u32();
    let stream_id = buf.get_u32();
    buf.advance(2);
    let packet_id = buf.get_u16();
    let max_packet_id = buf.get_u16();
    Some(LoggedHeader {
        rtp_timestamp,
        stream_id,
        packet_id,
        max_packet_id,
    })
}

/// Adapter between the pacer and an optional [`PacketEventSink`].
pub struct EventLogger {
    sink: Option<Box<dyn PacketEventSink + Send>>,
    last_audio_rtp: u64,
    last_video_rtp: u64,
}

impl EventLogger {
    pub fn new(sink: Option<Box<dyn PacketEventSink + Send>>) -> Self {
        EventLogger {
            sink,
            last_audio_rtp: 0,
            last_video_rtp: 0,
        }
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Parse `payload` and forward an event of `kind` to the sink.
    pub fn log(&mut self, payload: &[u8], kind: PacketEventKind, now: Instant, streams: MediaStreams) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let Some(header) = parse_logged_header(payload) else {
            tracing::debug!(len = payload.len(), ?kind, "packet too short to log");
            return;
        };

        let (media_type, rtp_timestamp) = if streams.audio == Some(header.stream_id) {
            self.last_audio_rtp = expand_rtp_timestamp(self.last_audio_rtp, header.rtp_timestamp);
            (MediaType::Audio, self.last_audio_rtp)
        } else if streams.video == Some(header.stream_id) {
            self.last_video_rtp = expand_rtp_timestamp(self.last_video_rtp, header.rtp_timestamp);
            (MediaType::Video, self.last_video_rtp)
        } else {
            tracing::trace!(stream_id = header.stream_id, "unknown stream when logging packet event");
            return;
        };

        sink.record_packet_event(PacketEvent {
            timestamp: now,
            kind,
            media_type,
            rtp_timestamp,
            packet_id: header.packet_id,
            max_packet_id: header.max_packet_id,
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
        });
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("enabled", &self.is_enabled())
            .field("last_audio_rtp", &self.last_audio_rtp)
            .field("last_video_rtp", &self.last_video_rtp)
            .finish()
    }
}

/// Build an RTP-shaped payload of `len` bytes carrying the logged fields.
///
/// Bytes past the logged header are zero.
pub fn synthetic_payload(
    stream_id: u32,
    rtp_timestamp: u32,
    packet_id: u16,
    max_packet_id: u16,
    len: usize,
) -> bytes::Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::with_capacity(len.max(LOGGED_HEADER_LEN));
    buf.put_u8(0x80);
    buf.put_u8(96);
    buf.put_u16(0);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(stream_id);
    buf.put_u16(0);
    buf.put_u16(packet_id);
    buf.put_u16(max_packet_id);
    buf.resize(len.max(LOGGED_HEADER_LEN), 0);
    buf.freeze()
}
