//! Per-loop timer facility.
//!
//! Timers are ordered lexicographically on `(expiration, sequence)` so that two timers scheduled
//! for the same absolute instant still fire in registration order — `sequence` is a process-wide
//! monotonically increasing counter, which already makes every `TimerId` unique on its own, so a
//! bare sequence number is sufficient here, unlike designs that pair a raw timer pointer with one.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifies a scheduled timer for cancellation. Opaque; construct only via the scheduling
/// methods on [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    callback: TimerCallback,
    interval: Option<Duration>,
}

/// A single loop's collection of scheduled timers, fired from [`EventLoop`](crate::event_loop::EventLoop)'s
/// iteration once their expiration has passed.
#[derive(Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    cancelling: HashSet<TimerId>,
}

impl TimerQueue {
    /// Creates an empty timer queue.
    pub fn new() -> Self {
        TimerQueue {
            entries: BTreeMap::new(),
            cancelling: HashSet::new(),
        }
    }

    /// Schedules `callback` to run once at `when`.
    pub fn run_at(&mut self, when: Instant, callback: TimerCallback) -> TimerId {
        self.insert(when, None, callback)
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.insert(Instant::now() + delay, None, callback)
    }

    /// Schedules `callback` to run every `interval`, starting after one `interval` has elapsed.
    pub fn run_every(&mut self, interval: Duration, callback: TimerCallback) -> TimerId {
        self.insert(Instant::now() + interval, Some(interval), callback)
    }

    /// Cancels a previously scheduled timer. A cancel issued from within the timer's own callback
    /// (i.e. before `run_expired` would otherwise re-arm it) is honored: the sequence is recorded
    /// in `cancelling` and consulted before re-insertion.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|&(_, seq), _| seq != id.0);
        self.cancelling.insert(id);
    }

    /// The duration until the next pending expiration, or `None` if no timers are scheduled. Used
    /// by the owning loop to bound its demultiplexer poll timeout.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|&(expiration, _)| expiration.saturating_duration_since(now))
    }

    /// Fires every timer whose expiration is `<= now`, removing non-repeating timers and
    /// re-inserting repeating ones at `expiration + interval` unless cancelled during their own
    /// callback.
    pub fn run_expired(&mut self, now: Instant) {
        let expired: Vec<(Instant, u64)> = self
            .entries
            .range(..=(now, u64::MAX))
            .map(|(&k, _)| k)
            .collect();

        for key in expired {
            let Some(mut entry) = self.entries.remove(&key) else {
                continue;
            };
            let id = TimerId(key.1);

            (entry.callback)();

            if let Some(interval) = entry.interval {
                if !self.cancelling.remove(&id) {
                    let next_key = (now + interval, key.1);
                    self.entries.insert(next_key, entry);
                }
            } else {
                self.cancelling.remove(&id);
            }
        }
    }

    fn insert(&mut self, when: Instant, interval: Option<Duration>, callback: TimerCallback) -> TimerId {
        let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.entries.insert((when, seq), TimerEntry { callback, interval });
        TimerId(seq)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn timers_scheduled_for_same_instant_fire_in_registration_order() {
        let mut queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let when = Instant::now();

        for i in 0..3 {
            let order = order.clone();
            queue.run_at(when, Box::new(move || order.lock().unwrap().push(i)));
        }

        queue.run_expired(when + Duration::from_millis(1));
        assert_eq!(vec![0, 1, 2], *order.lock().unwrap());
    }

    #[test]
    fn non_repeating_timer_does_not_fire_twice() {
        let mut queue = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let when = Instant::now();
        queue.run_at(when, Box::new(move || *c.lock().unwrap() += 1));

        queue.run_expired(when + Duration::from_millis(1));
        queue.run_expired(when + Duration::from_millis(2));
        assert_eq!(1, *count.lock().unwrap());
    }

    #[test]
    fn repeating_timer_reschedules_with_interval() {
        let mut queue = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let start = Instant::now();
        queue.run_every(Duration::from_millis(10), Box::new(move || *c.lock().unwrap() += 1));

        queue.run_expired(start + Duration::from_millis(11));
        assert_eq!(1, *count.lock().unwrap());
        assert!(queue.next_timeout(start + Duration::from_millis(11)).is_some());

        queue.run_expired(start + Duration::from_millis(22));
        assert_eq!(2, *count.lock().unwrap());
    }

    #[test]
    fn cancel_during_own_callback_prevents_rearm() {
        let mut queue = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let start = Instant::now();

        // Schedule, then simulate a self-cancelling repeating timer by cancelling immediately
        // after the id is known but before it would otherwise be re-armed.
        let c = count.clone();
        let id = queue.run_every(Duration::from_millis(5), Box::new(move || *c.lock().unwrap() += 1));
        queue.run_expired(start + Duration::from_millis(6));
        assert_eq!(1, *count.lock().unwrap());

        queue.cancel(id);
        queue.run_expired(start + Duration::from_millis(20));
        assert_eq!(1, *count.lock().unwrap());
    }

    #[test]
    fn cancel_before_expiration_removes_pending_timer() {
        let mut queue = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = queue.run_after(Duration::from_secs(60), Box::new(move || *c.lock().unwrap() += 1));

        queue.cancel(id);
        queue.run_expired(Instant::now() + Duration::from_secs(61));
        assert_eq!(0, *count.lock().unwrap());
    }
}
