//! # Paced Sender
//!
//! Pure scheduling logic that never sleeps or touches a socket. Releases queued
//! packets onto a [`PacketTransport`] in bursts of bounded size, one burst
//! per pacing interval.
//!
//! ```text
//!              quota exhausted                 transport pushed back
//!   Unblocked ─────────────────▶ BurstFull     Unblocked/BurstFull ─────▶ TransportBlocked
//!       ▲                            │                                        │
//!       └──── BurstResume wakeup ────┘          Unblocked ◀── TransportReady ─┘
//! ```
//!
//! ## Responsibilities
//!
//! 1. **Queueing**: first sends, resends (after dedup) and control packets
//! 2. **Admission**: consult [`BurstController`] once per pacing interval
//! 3. **Selection**: priority streams first, frame-aware pick within a queue
//! 4. **History**: record every send for dedup and selection
//! 5. **Backpressure**: suspend on `Blocked`, resume on the ready wakeup
//! 6. **Telemetry**: lifecycle events through [`EventLogger`]
//!
//! The pacer is driven from a single thread. Wakeups from the transport and
//! the task runner arrive as [`Wakeup`] messages and are applied by
//! [`PacedSender::run_pending_wakeups`] on that thread.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use quanta::{Clock, Instant};
use std::collections::HashMap;

use crate::burst::{BurstController, BurstState};
use crate::config::PacingConfig;
use crate::events::{EventLogger, MediaStreams, PacketEventKind, PacketEventSink};
use crate::history::SendHistory;
use crate::key::{DedupInfo, PacketBatch, PacketKey, PacketPurpose, QueuedPacket};
use crate::queue::PacketQueues;
use crate::stats::PacerStats;
use crate::transport::{PacketTransport, SendStatus, TaskRunner, WakeHandle, Wakeup};

// ─── State ──────────────────────────────────────────────────────────────────

/// Scheduler state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    /// Free to send; new work is sent right away.
    #[default]
    Unblocked,
    /// This interval's quota is used up; a burst resume is scheduled.
    BurstFull,
    /// The transport pushed back; waiting for its ready wakeup.
    TransportBlocked,
}

// ─── PacedSender ────────────────────────────────────────────────────────────

/// Burst-paced packet scheduler.
pub struct PacedSender<T: PacketTransport> {
    config: PacingConfig,
    clock: Clock,
    transport: T,
    runner: Box<dyn TaskRunner + Send>,
    logger: EventLogger,
    queues: PacketQueues,
    history: SendHistory,
    burst: BurstController,
    streams: MediaStreams,
    /// Transport byte counter right after the latest send of each stream.
    last_byte_sent: HashMap<u32, u64>,
    state: PacerState,
    /// Bumped every time a pacing interval opens.
    burst_generation: u64,
    /// Generation of the burst resume timer still outstanding, if any.
    resume_pending: Option<u64>,
    huge_queue_reported: bool,
    wake_tx: Sender<Wakeup>,
    wake_rx: Receiver<Wakeup>,
    stats: PacerStats,
}

impl<T: PacketTransport> PacedSender<T> {
    /// Create a pacer. `config` is expected to be validated.
    pub fn new<R>(config: PacingConfig, clock: Clock, transport: T, runner: R) -> Self
    where
        R: TaskRunner + Send + 'static,
    {
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        PacedSender {
            history: SendHistory::new(config.history_capacity()),
            burst: BurstController::new(&config),
            config,
            clock,
            transport,
            runner: Box::new(runner),
            logger: EventLogger::disabled(),
            queues: PacketQueues::new(),
            streams: MediaStreams::default(),
            last_byte_sent: HashMap::new(),
            state: PacerState::Unblocked,
            burst_generation: 0,
            resume_pending: None,
            huge_queue_reported: false,
            wake_tx,
            wake_rx,
            stats: PacerStats::default(),
        }
    }

    /// Attach a sink for packet lifecycle events.
    pub fn with_event_sink<S>(mut self, sink: S) -> Self
    where
        S: PacketEventSink + Send + 'static,
    {
        self.logger = EventLogger::new(Some(Box::new(sink)));
        self
    }

    // ─── Registration ───────────────────────────────────────────────────

    pub fn register_audio_stream(&mut self, stream_id: u32) {
        self.streams.audio = Some(stream_id);
    }

    pub fn register_video_stream(&mut self, stream_id: u32) {
        self.streams.video = Some(stream_id);
    }

    /// Mark a stream as high priority. Permanent.
    pub fn register_priority_stream(&mut self, stream_id: u32) {
        self.queues.register_priority_stream(stream_id);
    }

    // ─── Submission ─────────────────────────────────────────────────────

    /// Queue packets for their first transmission.
    ///
    /// All packets of one batch must share a priority class. Returns the
    /// number of packets queued rather than a success flag; an empty batch
    /// yields 0 and is otherwise accepted.
    pub fn send_packets(&mut self, packets: PacketBatch) -> usize {
        if packets.is_empty() {
            return 0;
        }
        for (key, _) in &packets {
            self.note_canceled_resubmission(key, "send");
        }
        let queued = self.queues.enqueue(packets, PacketPurpose::Normal);
        if self.state == PacerState::Unblocked {
            self.drive(false);
        }
        queued
    }

    /// Queue retransmissions, dropping the ones dedup deems redundant.
    ///
    /// Rejected packets are reported as
    /// [`PacketEventKind::RetransmissionRejected`]. Returns the number of
    /// packets queued rather than a success flag, so 0 means every packet was
    /// rejected or the batch was empty.
    pub fn resend_packets(&mut self, packets: PacketBatch, dedup: &DedupInfo) -> usize {
        if packets.is_empty() {
            return 0;
        }
        let now = self.clock.now();
        let mut accepted = Vec::with_capacity(packets.len());
        for (key, payload) in packets {
            self.note_canceled_resubmission(&key, "resend");
            if !self.should_resend(&key, dedup, now) {
                tracing::debug!(%key, "retransmission rejected");
                self.stats.retransmissions_rejected += 1;
                self.logger.log(
                    &payload,
                    PacketEventKind::RetransmissionRejected,
                    now,
                    self.streams,
                );
                continue;
            }
            accepted.push((key, payload));
        }
        let queued = self.queues.enqueue(accepted, PacketPurpose::Resend);
        if self.state == PacerState::Unblocked {
            self.drive(false);
        }
        queued
    }

    /// Send a control packet, bypassing burst accounting.
    ///
    /// While the transport is blocked the packet waits at the front of the
    /// priority queue instead. Always accepted, so there is no success flag
    /// to return.
    pub fn send_control_packet(&mut self, stream_id: u32, payload: Bytes) {
        self.stats.control_packets += 1;
        if self.state == PacerState::TransportBlocked {
            self.queues.enqueue_priority(
                PacketKey::control(stream_id),
                QueuedPacket::new(PacketPurpose::Control, payload),
            );
            return;
        }

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        let ready = self.wake_handle(Wakeup::TransportReady);
        if self.transport.send_packet(payload, ready) == SendStatus::Blocked {
            self.on_transport_blocked();
        }
    }

    /// Drop a packet that is still queued. No-op for unknown keys.
    pub fn cancel_sending_packet(&mut self, key: &PacketKey) {
        if self.queues.cancel(key) {
            self.stats.packets_canceled += 1;
        }
        if let Some(cancel_count) = self.history.cancel(key) {
            tracing::trace!(%key, cancel_count, "canceled a packet with send history");
        }
    }

    /// Dedup decision for a retransmission request of `key` at `now`.
    pub fn should_resend(&self, key: &PacketKey, dedup: &DedupInfo, now: Instant) -> bool {
        self.history
            .should_resend(key, dedup, now, self.streams.video)
    }

    // ─── Wakeups ────────────────────────────────────────────────────────

    /// Channel carrying wakeups for this pacer, for use in `select!` loops.
    pub fn wakeups(&self) -> &Receiver<Wakeup> {
        &self.wake_rx
    }

    /// Re-enter the send loop for one wakeup.
    pub fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::BurstResume(generation) => {
                if self.resume_pending == Some(generation) {
                    self.resume_pending = None;
                }
                if generation != self.burst_generation {
                    tracing::trace!(
                        generation,
                        current = self.burst_generation,
                        "stale burst resume dropped"
                    );
                    return;
                }
                // The ready wakeup resumes sending once the transport drains.
                if self.state == PacerState::TransportBlocked {
                    tracing::trace!("burst resume ignored while transport blocked");
                    return;
                }
                self.drive(true);
            }
            Wakeup::TransportReady => self.drive(false),
        }
    }

    /// Apply every wakeup posted so far. Returns how many were handled.
    pub fn run_pending_wakeups(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(wakeup) = self.wake_rx.try_recv() {
            self.handle_wakeup(wakeup);
            handled += 1;
        }
        handled
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Transport byte counter right after the last send of `key`, or 0.
    pub fn bytes_sent_for_packet(&self, key: &PacketKey) -> u64 {
        self.history
            .lookup(key)
            .map_or(0, |record| record.bytes_sent_after_send)
    }

    /// Transport byte counter right after the last send on `stream_id`, or 0.
    pub fn bytes_sent_for_stream(&self, stream_id: u32) -> u64 {
        self.last_byte_sent.get(&stream_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn burst_state(&self) -> &BurstState {
        self.burst.state()
    }

    pub fn stats(&self) -> &PacerStats {
        &self.stats
    }

    pub fn history(&self) -> &SendHistory {
        &self.history
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ─── Send Loop ──────────────────────────────────────────────────────

    /// Release as many queued packets as the current interval allows.
    ///
    /// `resumed` is set when the burst timer of the current interval fired.
    fn drive(&mut self, resumed: bool) {
        self.state = PacerState::Unblocked;
        if self.queues.is_empty() {
            return;
        }

        let queued = self.queues.len();
        let threshold = self.config.huge_queue_threshold();
        if queued > threshold && !self.huge_queue_reported {
            tracing::error!(
                queued,
                threshold,
                "pacer queue is implausibly long, upstream is not draining"
            );
            self.huge_queue_reported = true;
        }

        let now = self.clock.now();
        // The resume timer may fire marginally before the window end, so a
        // resume always opens a new interval.
        if self.burst.window_expired(now) || resumed {
            self.burst.start_interval(now, queued);
            self.burst_generation += 1;
            self.stats.bursts_started += 1;
        }

        while !self.queues.is_empty() {
            if self.burst.is_full() {
                let delay = self.burst.time_until_window_end(now);
                // One timer per interval, even when a ready wakeup lands
                // before the window ends.
                if self.resume_pending != Some(self.burst_generation) {
                    let wake = self.wake_handle(Wakeup::BurstResume(self.burst_generation));
                    self.runner.post_delayed(delay, wake);
                    self.resume_pending = Some(self.burst_generation);
                }
                self.state = PacerState::BurstFull;
                self.stats.bursts_full += 1;
                tracing::trace!(
                    remaining = self.queues.len(),
                    delay_us = delay.as_micros() as u64,
                    "burst full"
                );
                return;
            }

            let Some((key, packet)) = self.queues.pop_next(&self.history) else {
                break;
            };
            if self.send_one(key, packet, now) == SendStatus::Blocked {
                self.on_transport_blocked();
                return;
            }
            self.burst.on_packet_sent();
        }

        if self.history.maybe_rotate() {
            self.stats.history_rotations += 1;
            tracing::debug!(
                active = self.history.len(),
                capacity = self.history.capacity(),
                "send history rotated"
            );
        }
        self.state = PacerState::Unblocked;
    }

    /// Hand one popped packet to the transport and record it.
    fn send_one(&mut self, key: PacketKey, packet: QueuedPacket, now: Instant) -> SendStatus {
        if packet.purpose != PacketPurpose::Control {
            if let Some(record) = self.history.lookup(&key) {
                if record.cancel_count > 0 {
                    tracing::debug!(
                        %key,
                        cancel_count = record.cancel_count,
                        "sending a packet that was canceled before"
                    );
                }
            }
        }

        match packet.purpose {
            PacketPurpose::Resend => {
                self.stats.retransmissions += 1;
                self.logger
                    .log(&packet.payload, PacketEventKind::Retransmitted, now, self.streams);
            }
            PacketPurpose::Normal => {
                self.logger
                    .log(&packet.payload, PacketEventKind::SentToNetwork, now, self.streams);
            }
            PacketPurpose::Control => {}
        }

        tracing::trace!(%key, purpose = ?packet.purpose, "packet released");
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;

        let ready = self.wake_handle(Wakeup::TransportReady);
        let status = self.transport.send_packet(packet.payload, ready);

        let bytes_after_send = self.transport.bytes_sent();
        let audio_bytes = self
            .streams
            .audio
            .map_or(0, |audio| self.bytes_sent_for_stream(audio));
        self.history
            .record_send(key, now, bytes_after_send, audio_bytes);
        self.last_byte_sent.insert(key.stream_id, bytes_after_send);

        status
    }

    fn on_transport_blocked(&mut self) {
        self.state = PacerState::TransportBlocked;
        self.stats.transport_blocked += 1;
        tracing::debug!(remaining = self.queues.len(), "transport blocked");
    }

    fn note_canceled_resubmission(&self, key: &PacketKey, op: &'static str) {
        if let Some(record) = self.history.lookup(key) {
            if record.cancel_count > 0 {
                tracing::trace!(
                    %key,
                    op,
                    cancel_count = record.cancel_count,
                    "packet submitted again after cancel"
                );
            }
        }
    }

    fn wake_handle(&self, reason: Wakeup) -> WakeHandle {
        WakeHandle::new(self.wake_tx.clone(), reason)
    }
}

impl<T: PacketTransport + std::fmt::Debug> std::fmt::Debug for PacedSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacedSender")
            .field("state", &self.state)
            .field("queued", &self.queues.len())
            .field("burst", self.burst.state())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
