use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quanta::Clock;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::PacingConfig;
use crate::events::PacketEventSink;
use crate::key::{DedupInfo, PacketBatch, PacketKey};
use crate::pacer::PacedSender;
use crate::stats::PacerStats;
use crate::timer::TimerQueue;
use crate::transport::PacketTransport;

/// Commands buffered between handles and the worker.
const COMMAND_CAPACITY: usize = 4096;

/// Upper bound on how long the worker sleeps with no timer pending.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Error returned when a command cannot reach the pacer worker.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("pacer command queue is full")]
    Full,
    #[error("pacer worker is not running")]
    Disconnected,
    #[error("failed to spawn pacer worker: {0}")]
    Spawn(#[from] std::io::Error),
}

enum Command {
    RegisterAudio(u32),
    RegisterVideo(u32),
    RegisterPriority(u32),
    Send(PacketBatch),
    Resend(PacketBatch, DedupInfo),
    Control(u32, Bytes),
    Cancel(PacketKey),
    Shutdown,
}

/// Cloneable submission handle for a [`PacerRuntime`].
///
/// Every method returns immediately. Packets are handed to the worker through
/// a bounded queue; [`RuntimeError::Full`] means the worker is falling behind.
#[derive(Clone)]
pub struct PacerHandle {
    tx: Sender<Command>,
}

impl PacerHandle {
    pub fn register_audio_stream(&self, stream_id: u32) -> Result<(), RuntimeError> {
        self.submit(Command::RegisterAudio(stream_id))
    }

    pub fn register_video_stream(&self, stream_id: u32) -> Result<(), RuntimeError> {
        self.submit(Command::RegisterVideo(stream_id))
    }

    pub fn register_priority_stream(&self, stream_id: u32) -> Result<(), RuntimeError> {
        self.submit(Command::RegisterPriority(stream_id))
    }

    pub fn send_packets(&self, packets: PacketBatch) -> Result<(), RuntimeError> {
        self.submit(Command::Send(packets))
    }

    pub fn resend_packets(&self, packets: PacketBatch, dedup: DedupInfo) -> Result<(), RuntimeError> {
        self.submit(Command::Resend(packets, dedup))
    }

    pub fn send_control_packet(&self, stream_id: u32, payload: Bytes) -> Result<(), RuntimeError> {
        self.submit(Command::Control(stream_id, payload))
    }

    pub fn cancel_sending_packet(&self, key: PacketKey) -> Result<(), RuntimeError> {
        self.submit(Command::Cancel(key))
    }

    fn submit(&self, command: Command) -> Result<(), RuntimeError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => RuntimeError::Full,
            TrySendError::Disconnected(_) => RuntimeError::Disconnected,
        })
    }
}

/// A [`PacedSender`] running on its own thread.
///
/// The worker owns the pacer and a [`TimerQueue`]. It sleeps until a
/// command arrives, a wakeup is posted, or the next burst timer is due.
///
/// Dropping the runtime shuts the worker down; packets still queued are
/// discarded.
pub struct PacerRuntime {
    handle: PacerHandle,
    stats: Arc<Mutex<PacerStats>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PacerRuntime {
    /// Start a worker pacing onto `transport`.
    pub fn spawn<T>(config: PacingConfig, clock: Clock, transport: T) -> Result<Self, RuntimeError>
    where
        T: PacketTransport + Send + 'static,
    {
        Self::spawn_inner(config, clock, transport, None)
    }

    /// Like [`PacerRuntime::spawn`], forwarding packet events to `sink`.
    pub fn spawn_with_sink<T, S>(
        config: PacingConfig,
        clock: Clock,
        transport: T,
        sink: S,
    ) -> Result<Self, RuntimeError>
    where
        T: PacketTransport + Send + 'static,
        S: PacketEventSink + Send + 'static,
    {
        Self::spawn_inner(config, clock, transport, Some(Box::new(sink)))
    }

    fn spawn_inner<T>(
        config: PacingConfig,
        clock: Clock,
        transport: T,
        sink: Option<Box<dyn PacketEventSink + Send>>,
    ) -> Result<Self, RuntimeError>
    where
        T: PacketTransport + Send + 'static,
    {
        let timers = TimerQueue::new(clock.clone());
        let mut pacer = PacedSender::new(config, clock, transport, timers.clone());
        if let Some(sink) = sink {
            pacer = pacer.with_event_sink(sink);
        }

        let (tx, rx) = bounded(COMMAND_CAPACITY);
        let stats = Arc::new(Mutex::new(PacerStats::default()));
        let stats_clone = stats.clone();

        let worker = thread::Builder::new()
            .name("strata-pacer".into())
            .spawn(move || pacer_worker(pacer, timers, rx, stats_clone))?;

        Ok(Self {
            handle: PacerHandle { tx },
            stats,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> PacerHandle {
        self.handle.clone()
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> PacerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stops the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.tx.send(Command::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for PacerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pacer_worker<T: PacketTransport>(
    mut pacer: PacedSender<T>,
    timers: TimerQueue,
    commands: Receiver<Command>,
    stats: Arc<Mutex<PacerStats>>,
) {
    let wakeups = pacer.wakeups().clone();
    loop {
        let timeout = timers.next_timeout().unwrap_or(IDLE_POLL);
        crossbeam_channel::select! {
            recv(commands) -> msg => match msg {
                Ok(Command::Shutdown) | Err(_) => break,
                Ok(command) => apply(&mut pacer, command),
            },
            recv(wakeups) -> msg => {
                if let Ok(wakeup) = msg {
                    pacer.handle_wakeup(wakeup);
                }
            },
            default(timeout) => {},
        }

        timers.fire_due();
        pacer.run_pending_wakeups();
        *stats.lock().unwrap_or_else(|e| e.into_inner()) = pacer.stats().clone();
    }

    if !pacer.is_empty() {
        tracing::debug!(discarded = pacer.len(), "pacer worker stopped with packets queued");
    }
}

fn apply<T: PacketTransport>(pacer: &mut PacedSender<T>, command: Command) {
    match command {
        Command::RegisterAudio(id) => pacer.register_audio_stream(id),
        Command::RegisterVideo(id) => pacer.register_video_stream(id),
        Command::RegisterPriority(id) => pacer.register_priority_stream(id),
        Command::Send(packets) => {
            pacer.send_packets(packets);
        }
        Command::Resend(packets, dedup) => {
            pacer.resend_packets(packets, &dedup);
        }
        Command::Control(id, payload) => pacer.send_control_packet(id, payload),
        Command::Cancel(key) => pacer.cancel_sending_packet(&key),
        Command::Shutdown => {}
    }
}
