//! # strata-pacing
//!
//! Outbound packet pacer for Strata media streams.
//!
//! Releases audio/video packets onto a rate-limited transport in bursts of
//! bounded size, filters redundant retransmission requests against a
//! time-windowed send history, and suspends cleanly when the transport
//! pushes back.
//!
//! ## Crate structure
//!
//! - [`key`]: Packet identity and queued packet types
//! - [`queue`]: High- and normal-priority send queues, frame-aware selection
//! - [`history`]: Two-generation send history for dedup and selection
//! - [`burst`]: Per-interval admission with three-interval smoothing
//! - [`pacer`]: The scheduler driving everything above
//! - [`events`]: Packet lifecycle events for telemetry sinks
//! - [`transport`]: Transport and task-runner interfaces, wakeups
//! - [`timer`]: Deadline-ordered task runner
//! - [`runtime`]: Pacer on a dedicated worker thread
//! - [`config`]: Tuning, TOML loading
//! - [`stats`]: Counters

pub mod burst;
pub mod config;
pub mod events;
pub mod history;
pub mod key;
pub mod pacer;
pub mod queue;
pub mod runtime;
pub mod stats;
pub mod timer;
pub mod transport;

pub use config::{ConfigError, PacingConfig};
pub use events::{PacketEvent, PacketEventKind, PacketEventSink};
pub use key::{DedupInfo, PacketBatch, PacketKey, PacketPurpose};
pub use pacer::{PacedSender, PacerState};
pub use runtime::{PacerHandle, PacerRuntime, RuntimeError};
pub use stats::PacerStats;
pub use transport::{PacketTransport, SendStatus, TaskRunner, WakeHandle, Wakeup};
