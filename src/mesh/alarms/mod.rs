//! The alarm queue, a priority queue of deferred work.
//!
//! Alarms are plain data tokens rather than closures; whoever drives
//! the queue supplies the dispatch function when firing, so scheduled
//! work can freely mutate node state without the queue holding any
//! reference to it. An alarm may reschedule itself by returning
//! `AlarmNext::Reschedule` from dispatch, or stop with
//! `AlarmNext::Cancel`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use intmap::IntMap;
use log::warn;

/// Dispatch functions taking longer than this are reported.
pub const WARN_ALARM_EXECUTION_DURATION: Duration = Duration::from_secs(1);

/// Handle to a scheduled alarm.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct AlarmId(u64);

/// What an alarm wants to happen after firing.
pub enum AlarmNext {
    /// Run again after the given delay.
    Reschedule(Duration),
    /// The alarm is done; structural cancellation.
    Cancel,
}

struct Entry<T> {
    token: T,
    fire_at: Instant,
    coalesce_key: Option<u64>,
}

/// A queue of alarms ordered by fire time; ties fire in
/// registration order.
pub struct AlarmQueue<T> {
    // lazy deletion: the heap may reference ids no longer in
    // `entries`, which are skipped on pop
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    entries: IntMap<Entry<T>>,
    approx: IntMap<u64>,
    next_id: u64,
    next_seq: u64,
    warn_threshold: Duration,
}

impl<T> AlarmQueue<T> {
    pub fn new() -> Self {
        AlarmQueue {
            heap: BinaryHeap::new(),
            entries: IntMap::new(),
            approx: IntMap::new(),
            next_id: 1,
            next_seq: 0,
            warn_threshold: WARN_ALARM_EXECUTION_DURATION,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Schedules `token` to fire `delay` from `now`.
    pub fn register(&mut self, delay: Duration, token: T, now: Instant) -> AlarmId {
        self.push_entry(now + delay, token, None)
    }

    /// Schedules `token` to fire within `[min_delay, max_delay]` of
    /// `now`, coalescing with any alarm previously registered under
    /// the same `key` that already fires inside that window.
    pub fn register_approx(
        &mut self,
        max_delay: Duration,
        min_delay: Duration,
        key: u64,
        token: T,
        now: Instant,
    ) -> AlarmId {
        if let Some(id) = self.approx.get(key).copied() {
            if let Some(entry) = self.entries.get(id) {
                if entry.fire_at >= now + min_delay && entry.fire_at <= now + max_delay {
                    return AlarmId(id);
                }
            }
            self.unregister(AlarmId(id));
        }
        let id = self.push_entry(now + max_delay, token, Some(key));
        self.approx.remove(key);
        self.approx.insert(key, id.0);
        id
    }

    /// Cancels a scheduled alarm. Unknown handles are ignored.
    pub fn unregister(&mut self, id: AlarmId) {
        if let Some(entry) = self.entries.remove(id.0) {
            if let Some(key) = entry.coalesce_key {
                if self.approx.get(key) == Some(&id.0) {
                    self.approx.remove(key);
                }
            }
        }
    }

    /// Returns the next alarm to fire and how long until it does
    /// (zero if overdue), or `None` when the queue is empty.
    pub fn time_to_next(&mut self, now: Instant) -> Option<(AlarmId, Duration)> {
        loop {
            let Reverse((fire_at, _, id)) = *self.heap.peek()?;
            if self.entries.contains_key(id) {
                return Some((AlarmId(id), fire_at.saturating_duration_since(now)));
            }
            // stale heap entry left behind by unregister
            self.heap.pop();
        }
    }

    /// Fires every alarm due at `now`, handing its token to
    /// `dispatch`; when nothing is due and `force_fire_one` is set,
    /// the earliest alarm fires anyway. Returns the delay until the
    /// next pending alarm.
    pub fn fire_ready<F>(
        &mut self,
        now: Instant,
        force_fire_one: bool,
        mut dispatch: F,
    ) -> Option<Duration>
    where
        F: FnMut(&T) -> AlarmNext,
    {
        let mut fired_one = false;
        loop {
            let (id, remaining) = match self.time_to_next(now) {
                Some(next) => next,
                None => return None,
            };
            if !remaining.is_zero() && (fired_one || !force_fire_one) {
                return Some(remaining);
            }
            self.heap.pop();
            fired_one = true;

            let entry = match self.entries.get(id.0) {
                Some(entry) => entry,
                None => continue,
            };
            let started = Instant::now();
            let next = dispatch(&entry.token);
            let elapsed = started.elapsed();
            if elapsed > self.warn_threshold {
                warn!("alarm dispatch overran: took {:?}", elapsed);
            }

            match next {
                AlarmNext::Reschedule(delay) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    let fire_at = now + delay;
                    if let Some(entry) = self.entries.get_mut(id.0) {
                        entry.fire_at = fire_at;
                    }
                    self.heap.push(Reverse((fire_at, seq, id.0)));
                }
                AlarmNext::Cancel => self.unregister(id),
            }
        }
    }

    fn push_entry(&mut self, fire_at: Instant, token: T, coalesce_key: Option<u64>) -> AlarmId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            Entry {
                token,
                fire_at,
                coalesce_key,
            },
        );
        self.heap.push(Reverse((fire_at, seq, id)));
        AlarmId(id)
    }
}

impl<T> Default for AlarmQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_fires_in_time_order() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        q.register(3 * SEC, "late", t0);
        q.register(SEC, "early", t0);
        let mut fired = Vec::new();
        q.fire_ready(t0 + 5 * SEC, false, |token| {
            fired.push(*token);
            AlarmNext::Cancel
        });
        assert_eq!(vec!["early", "late"], fired);
        assert!(q.is_empty());
    }

    #[test]
    fn test_same_fire_time_keeps_registration_order() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        q.register(SEC, "first", t0);
        q.register(SEC, "second", t0);
        let mut fired = Vec::new();
        q.fire_ready(t0 + 2 * SEC, false, |token| {
            fired.push(*token);
            AlarmNext::Cancel
        });
        assert_eq!(vec!["first", "second"], fired);
    }

    #[test]
    fn test_reschedule_from_dispatch() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        q.register(SEC, (), t0);
        let next = q.fire_ready(t0 + SEC, false, |_| AlarmNext::Reschedule(10 * SEC));
        assert_eq!(Some(10 * SEC), next);
        assert_eq!(1, q.len());
        let mut count = 0;
        q.fire_ready(t0 + 12 * SEC, false, |_| {
            count += 1;
            AlarmNext::Cancel
        });
        assert_eq!(1, count);
        assert!(q.is_empty());
    }

    #[test]
    fn test_force_fire_one_fires_earliest_only() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        q.register(5 * SEC, "a", t0);
        q.register(7 * SEC, "b", t0);
        let mut fired = Vec::new();
        q.fire_ready(t0, true, |token| {
            fired.push(*token);
            AlarmNext::Cancel
        });
        assert_eq!(vec!["a"], fired);
        assert_eq!(1, q.len());
    }

    #[test]
    fn test_unregister_before_fire() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        let id = q.register(SEC, "gone", t0);
        q.register(2 * SEC, "kept", t0);
        q.unregister(id);
        let mut fired = Vec::new();
        q.fire_ready(t0 + 3 * SEC, false, |token| {
            fired.push(*token);
            AlarmNext::Cancel
        });
        assert_eq!(vec!["kept"], fired);
    }

    #[test]
    fn test_register_approx_coalesces_within_window() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        let first = q.register_approx(20 * SEC, 10 * SEC, 7, "cleanup", t0);
        // still inside [min, max] a second later: same alarm
        let second = q.register_approx(20 * SEC, 10 * SEC, 7, "cleanup", t0 + SEC);
        assert_eq!(first, second);
        assert_eq!(1, q.len());
        // far outside the window: replaced
        let third = q.register_approx(20 * SEC, 10 * SEC, 7, "cleanup", t0 + 15 * SEC);
        assert_ne!(first, third);
        assert_eq!(1, q.len());
    }

    #[test]
    fn test_time_to_next_skips_unregistered() {
        let mut q = AlarmQueue::new();
        let t0 = Instant::now();
        let id = q.register(SEC, "x", t0);
        q.register(4 * SEC, "y", t0);
        q.unregister(id);
        let (_, delay) = q.time_to_next(t0).unwrap();
        assert_eq!(4 * SEC, delay);
    }
}
