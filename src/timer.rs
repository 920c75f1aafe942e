//! Timer queue (C3): an ordered collection of named, pending timers with
//! absolute fire times. Names need not be unique; cancellation removes the
//! oldest match (FIFO by insertion order).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::info;

/// A single pending timer. `name` is both the identifier used for
/// cancellation and the command payload handed to the execute hook on
/// expiry.
#[derive(Debug, Clone)]
pub struct Timer {
    pub name: String,
    pub fire_at: Instant,
}

/// Insertion-ordered store of pending timers. A `VecDeque` is sufficient
/// here (rather than an intrusive linked list with manual unlink, as the
/// original C source uses): the expected cardinality is small (human-scale
/// timer churn, see spec's Non-goals), so `cancel_first`'s O(n) scan and
/// `sweep`'s O(n) pass cost nothing in practice, and `retain`-style removal
/// is both simpler and less error-prone than hand-rolled unlinking.
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: VecDeque<Timer>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            timers: VecDeque::new(),
        }
    }

    /// Insert a new timer for `name`, firing `offset` from now. A negative
    /// offset (passed in as `None`, see `insert_from_str`) is rejected by
    /// the caller before this is invoked.
    pub fn insert(&mut self, name: impl Into<String>, offset: Duration) {
        let name = name.into();
        let fire_at = Instant::now() + offset;
        info!("new timer: {} ({:?})", name, offset);
        self.timers.push_back(Timer { name, fire_at });
    }

    /// Parse `offset_seconds` and insert, or reject with a log line if it's
    /// negative or unparsable. Returns whether a timer was inserted.
    pub fn insert_from_str(&mut self, name: &str, offset_seconds: &str) -> bool {
        match offset_seconds.parse::<i64>() {
            Ok(secs) if secs >= 0 => {
                self.insert(name, Duration::from_secs(secs as u64));
                true
            }
            _ => {
                info!("bogus offset for timer, ignoring");
                false
            }
        }
    }

    /// Remove the first (oldest) timer named `name`. Returns whether one
    /// was found.
    pub fn cancel_first(&mut self, name: &str) -> bool {
        if let Some(pos) = self.timers.iter().position(|t| t.name == name) {
            info!("cancelling timer: {}", name);
            self.timers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove and return, in insertion order, every timer whose fire time
    /// has passed as of `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<Timer> {
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].fire_at <= now {
                fired.push(self.timers.remove(i).expect("index in bounds"));
                // don't advance i: remove shifted the rest down
            } else {
                i += 1;
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }
}
