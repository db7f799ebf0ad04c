//! # Collaborator Interfaces
//!
//! The pacer owns no sockets and no timers. It talks to:
//!
//! - a [`PacketTransport`] that sends one packet at a time and may push back,
//! - a [`TaskRunner`] that fires a [`WakeHandle`] after a delay,
//!
//! Both are handed a `WakeHandle` instead of a callback. Firing it posts a
//! [`Wakeup`] onto the pacer's channel; the pacer's owner drains that channel
//! on the pacer's own thread, so every mutation of queue, history and burst
//! state stays single-writer even when the transport completes elsewhere.

use bytes::Bytes;
use crossbeam_channel::Sender;
use std::time::Duration;

/// Result of handing one packet to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted; more packets may follow immediately.
    Sent,
    /// Accepted, but the transport cannot take more for now. It will fire the
    /// wake handle it was given once it can.
    Blocked,
}

/// Why the pacer is being re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wakeup {
    /// A burst interval ended. Carries the generation of the interval whose
    /// quota ran out; resumes for older intervals are dropped.
    BurstResume(u64),
    /// The transport drained and accepts packets again.
    TransportReady,
}

/// Cloneable, thread-safe handle that re-enters the pacer.
///
/// Firing a handle whose pacer has been dropped does nothing.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    tx: Sender<Wakeup>,
    reason: Wakeup,
}

impl WakeHandle {
    pub(crate) fn new(tx: Sender<Wakeup>, reason: Wakeup) -> Self {
        WakeHandle { tx, reason }
    }

    pub fn reason(&self) -> Wakeup {
        self.reason
    }

    /// Post the wakeup. Consumes the handle: each one fires at most once.
    pub fn wake(self) {
        let _ = self.tx.send(self.reason);
    }
}

/// Outbound packet transport.
///
/// A transport returning [`SendStatus::Blocked`] must fire `ready` exactly
/// once, eventually, even on error. Until it does the pacer sends nothing.
/// On [`SendStatus::Sent`] the handle may simply be dropped.
pub trait PacketTransport {
    fn send_packet(&mut self, packet: Bytes, ready: WakeHandle) -> SendStatus;

    /// Cumulative bytes accepted so far.
    fn bytes_sent(&self) -> u64;
}

/// Delayed re-invocation.
pub trait TaskRunner {
    fn post_delayed(&mut self, delay: Duration, wake: WakeHandle);
}

impl<T: PacketTransport + ?Sized> PacketTransport for Box<T> {
    fn send_packet(&mut self, packet: Bytes, ready: WakeHandle) -> SendStatus {
        (**self).send_packet(packet, ready)
    }

    fn bytes_sent(&self) -> u64 {
        (**self).bytes_sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_posts_reason() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = WakeHandle::new(tx, Wakeup::TransportReady);
        let copy = handle.clone();
        handle.wake();
        copy.wake();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Wakeup::TransportReady; 2]);
    }

    #[test]
    fn wake_after_receiver_dropped_is_silent() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        WakeHandle::new(tx, Wakeup::BurstResume(1)).wake();
    }
}
