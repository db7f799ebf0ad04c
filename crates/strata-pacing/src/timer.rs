//! Deadline-ordered [`TaskRunner`] for callers that own their event loop.

use quanta::{Clock, Instant};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{TaskRunner, WakeHandle};

#[derive(Debug, Default)]
struct Timers {
    pending: BTreeMap<(Instant, u64), WakeHandle>,
    next_id: u64,
}

/// Pending delayed wakeups, shared between the pacer and its event loop.
///
/// Clones share the same queue: hand one to the pacer as its task runner and
/// keep another to call [`TimerQueue::fire_due`] from the loop.
#[derive(Debug, Clone)]
pub struct TimerQueue {
    clock: Clock,
    timers: Arc<Mutex<Timers>>,
}

impl TimerQueue {
    pub fn new(clock: Clock) -> Self {
        TimerQueue {
            clock,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Time until the earliest deadline, zero if already due.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Fire every wakeup whose deadline is at or before now.
    ///
    /// Returns the number fired.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<WakeHandle> = {
            let mut timers = self.lock();
            let mut fired = Vec::new();
            while let Some(entry) = timers.pending.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                fired.push(entry.remove());
            }
            fired
        };
        let count = due.len();
        due.into_iter().for_each(WakeHandle::wake);
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskRunner for TimerQueue {
    fn post_delayed(&mut self, delay: Duration, wake: WakeHandle) {
        let deadline = self.clock.now() + delay;
        let mut timers = self.lock();
        let id = timers.next_id;
        timers.next_id += 1;
        timers.pending.insert((deadline, id), wake);
    }
}
