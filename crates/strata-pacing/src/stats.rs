//! # Pacer Statistics
//!
//! Counters for the pacer, designed for JSON export.

use serde::Serialize;

/// Aggregate pacer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PacerStats {
    /// Packets handed to the transport (all purposes).
    pub packets_sent: u64,
    /// Payload bytes handed to the transport.
    pub bytes_sent: u64,
    /// Retransmissions handed to the transport.
    pub retransmissions: u64,
    /// Retransmission requests dropped by dedup.
    pub retransmissions_rejected: u64,
    /// Control packets sent, queued or direct.
    pub control_packets: u64,
    /// Pacing intervals opened.
    pub bursts_started: u64,
    /// Times the quota ran out with packets still queued.
    pub bursts_full: u64,
    /// Times the transport pushed back.
    pub transport_blocked: u64,
    /// Queued packets removed by cancel.
    pub packets_canceled: u64,
    /// Send history generations promoted.
    pub history_rotations: u64,
}

impl PacerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of sent packets that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.packets_sent as f64
        }
    }

    /// Share of retransmission requests that dedup rejected.
    pub fn rejection_ratio(&self) -> f64 {
        let requests = self.retransmissions + self.retransmissions_rejected;
        if requests == 0 {
            0.0
        } else {
            self.retransmissions_rejected as f64 / requests as f64
        }
    }
}
