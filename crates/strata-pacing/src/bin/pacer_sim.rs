//! # Pacer Simulator
//!
//! Feeds synthetic 30 fps video and 50 Hz audio through a [`PacedSender`]
//! on a simulated clock, against a transport that pushes back every N
//! packets, then prints the pacer counters as JSON.
//!
//! ## Usage
//!
//! ```bash
//! pacer-sim --frames 300 --packets-per-frame 40 --block-every 25
//! pacer-sim --config pacing.toml
//! RUST_LOG=strata_pacing=debug pacer-sim
//! ```

use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use quanta::{Clock, Instant};
use strata_pacing::events::{synthetic_payload, EventLog};
use strata_pacing::timer::TimerQueue;
use strata_pacing::{
    DedupInfo, PacedSender, PacingConfig, PacketBatch, PacketEventKind, PacketKey,
    PacketTransport, SendStatus, WakeHandle,
};

const VIDEO_STREAM: u32 = 0x0000_1111;
const AUDIO_STREAM: u32 = 0x0000_2222;
const VIDEO_FRAME_MS: u64 = 33;
const AUDIO_FRAME_MS: u64 = 20;
const CONTROL_EVERY_MS: u64 = 100;
const VIDEO_PACKET_LEN: usize = 1200;
const AUDIO_PACKET_LEN: usize = 160;
/// Time the transport needs to drain after pushing back.
const TRANSPORT_DRAIN: Duration = Duration::from_millis(2);
/// Extra simulated time after the last frame so the queue can empty.
const TAIL_MS: u64 = 2_000;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Cli::parse();
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config '{}': {}", path, e))?;
            PacingConfig::from_toml_str(&text)?
        }
        None => PacingConfig::default(),
    };

    tracing::info!(
        frames = args.frames,
        packets_per_frame = args.packets_per_frame,
        block_every = args.block_every,
        target_burst = config.target_burst_size,
        max_burst = config.max_burst_size,
        "pacer-sim starting"
    );

    // ── Pacer ───────────────────────────────────────────────────
    let (clock, mock) = Clock::mock();
    let timers = TimerQueue::new(clock.clone());
    let events = EventLog::new();
    let transport = SimTransport::new(clock.clone(), args.block_every);
    let mut pacer = PacedSender::new(config, clock.clone(), transport, timers.clone())
        .with_event_sink(events.clone());
    pacer.register_video_stream(VIDEO_STREAM);
    pacer.register_audio_stream(AUDIO_STREAM);
    pacer.register_priority_stream(AUDIO_STREAM);

    // ── Simulation loop ─────────────────────────────────────────
    let media_end_ms = args.frames as u64 * VIDEO_FRAME_MS;
    let mut video_frame: u32 = 0;
    let mut audio_frame: u32 = 0;
    let mut previous_frame: PacketBatch = Vec::new();
    let mut event_counts = EventCounts::default();

    for ms in 0..media_end_ms + TAIL_MS {
        let capture_us = ms * 1_000;

        if ms % VIDEO_FRAME_MS == 0 && video_frame < args.frames {
            let frame = video_packets(capture_us, video_frame, args.packets_per_frame);
            pacer.send_packets(frame.clone());

            // Every fifth frame, ask for part of the previous frame twice:
            // the first request passes dedup, the second does not.
            if video_frame % 5 == 0 && !previous_frame.is_empty() {
                let nack: PacketBatch = previous_frame.iter().take(3).cloned().collect();
                let dedup = DedupInfo::new(Duration::from_millis(20));
                pacer.resend_packets(nack.clone(), &dedup);
                pacer.resend_packets(nack, &dedup);
            }
            previous_frame = frame;
            video_frame += 1;
        }

        if ms % AUDIO_FRAME_MS == 0 && ms < media_end_ms {
            pacer.send_packets(audio_packet(capture_us, audio_frame));
            audio_frame += 1;
        }

        if ms % CONTROL_EVERY_MS == 0 && ms < media_end_ms {
            pacer.send_control_packet(VIDEO_STREAM, Bytes::from_static(b"rtcp-sender-report"));
        }

        mock.increment(Duration::from_millis(1));
        let now = clock.now();
        pacer.transport_mut().release_if_drained(now);
        timers.fire_due();
        pacer.run_pending_wakeups();

        for event in events.drain() {
            event_counts.record(event.kind);
        }
    }

    // ── Report ──────────────────────────────────────────────────
    if !pacer.is_empty() {
        tracing::warn!(remaining = pacer.len(), "queue did not drain");
    }
    tracing::info!(
        video_frames = video_frame,
        audio_frames = audio_frame,
        transport_bytes = pacer.transport().bytes_sent(),
        "pacer-sim finished"
    );

    let report = serde_json::json!({
        "stats": pacer.stats(),
        "retransmit_ratio": pacer.stats().retransmit_ratio(),
        "rejection_ratio": pacer.stats().rejection_ratio(),
        "events": event_counts,
        "remaining": pacer.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn video_packets(capture_us: u64, frame_id: u32, count: u16) -> PacketBatch {
    let rtp_timestamp = frame_id.wrapping_mul(3_000);
    (0..count)
        .map(|packet_id| {
            (
                PacketKey::new(capture_us, VIDEO_STREAM, frame_id, packet_id),
                synthetic_payload(
                    VIDEO_STREAM,
                    rtp_timestamp,
                    packet_id,
                    count - 1,
                    VIDEO_PACKET_LEN,
                ),
            )
        })
        .collect()
}

fn audio_packet(capture_us: u64, frame_id: u32) -> PacketBatch {
    let rtp_timestamp = frame_id.wrapping_mul(960);
    vec![(
        PacketKey::new(capture_us, AUDIO_STREAM, frame_id, 0),
        synthetic_payload(AUDIO_STREAM, rtp_timestamp, 0, 0, AUDIO_PACKET_LEN),
    )]
}

// ─── Simulated Transport ────────────────────────────────────────────────────

/// Accepts everything, but pushes back on every `block_every`-th packet and
/// becomes ready again after [`TRANSPORT_DRAIN`].
struct SimTransport {
    clock: Clock,
    bytes: u64,
    sends: u64,
    block_every: u64,
    blocked: Option<(Instant, WakeHandle)>,
}

impl SimTransport {
    fn new(clock: Clock, block_every: u64) -> Self {
        Self {
            clock,
            bytes: 0,
            sends: 0,
            block_every,
            blocked: None,
        }
    }

    fn release_if_drained(&mut self, now: Instant) {
        match self.blocked.take() {
            Some((ready_at, ready)) if now >= ready_at => ready.wake(),
            pending => self.blocked = pending,
        }
    }
}

impl PacketTransport for SimTransport {
    fn send_packet(&mut self, packet: Bytes, ready: WakeHandle) -> SendStatus {
        self.bytes += packet.len() as u64;
        self.sends += 1;
        if self.block_every > 0 && self.sends % self.block_every == 0 {
            self.blocked = Some((self.clock.now() + TRANSPORT_DRAIN, ready));
            SendStatus::Blocked
        } else {
            SendStatus::Sent
        }
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes
    }
}

#[derive(Debug, Default, serde::Serialize)]
struct EventCounts {
    sent_to_network: u64,
    retransmitted: u64,
    retransmission_rejected: u64,
}

impl EventCounts {
    fn record(&mut self, kind: PacketEventKind) {
        match kind {
            PacketEventKind::SentToNetwork => self.sent_to_network += 1,
            PacketEventKind::Retransmitted => self.retransmitted += 1,
            PacketEventKind::RetransmissionRejected => self.retransmission_rejected += 1,
        }
    }
}

// ─── CLI ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pacer-sim",
    about = "Drive the Strata packet pacer with synthetic media",
    after_help = "Prints pacer statistics as JSON on stdout. Logs go to stderr (RUST_LOG)."
)]
struct Cli {
    /// TOML pacing config.
    #[arg(long, short, env = "PACER_CONFIG")]
    config: Option<String>,

    /// Video frames to send.
    #[arg(long, short, default_value_t = 150)]
    frames: u32,

    /// Packets per video frame.
    #[arg(long, short, default_value_t = 30, value_parser = clap::value_parser!(u16).range(1..))]
    packets_per_frame: u16,

    /// Transport pushes back every n packets, 0 disables.
    #[arg(long, short, default_value_t = 40)]
    block_every: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_defaults_and_short_flags() {
        let cli = Cli::try_parse_from(["pacer-sim"]).unwrap();
        assert_eq!(cli.frames, 150);
        assert_eq!(cli.packets_per_frame, 30);
        assert_eq!(cli.block_every, 40);

        let cli = Cli::try_parse_from([
            "pacer-sim", "-f", "300", "-p", "40", "-b", "0", "-c", "p.toml",
        ])
        .unwrap();
        assert_eq!(cli.frames, 300);
        assert_eq!(cli.packets_per_frame, 40);
        assert_eq!(cli.block_every, 0);
        assert_eq!(cli.config.as_deref(), Some("p.toml"));
    }

    #[test]
    fn cli_rejects_empty_frames() {
        assert!(Cli::try_parse_from(["pacer-sim", "--packets-per-frame", "0"]).is_err());
        assert!(Cli::try_parse_from(["pacer-sim", "--bogus"]).is_err());
    }
}
