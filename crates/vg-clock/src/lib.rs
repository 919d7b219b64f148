//! Monotonic time source and timer scheduling for the Framer (C1).
//!
//! The Framer (C7) is a single-threaded, non-blocking reactor: it never
//! `.await`s a sleep. Instead it asks a [`Clock`] for "now" once per duty
//! cycle and asks a [`TimerWheel`] which of its scheduled deadlines have
//! elapsed. Tests substitute [`TestClock`] to drive timers deterministically
//! without real wall-clock delay.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nanoseconds since an arbitrary epoch fixed at clock creation.
pub type NanoTime = u64;

/// A source of monotonic time.
///
/// iLink3 session `uuid`s are minted from `now_nanos()` at connect time
/// (spec §4.5 "UUID policy"), so the clock doubles as the uuid source.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> NanoTime;

    fn now(&self) -> Instant;
}

/// The real, wall-clock-driven implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> NanoTime {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as NanoTime
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Mirrors the "disable the channel supplier / advance time by hand" style
/// of test control the end-to-end scenarios in spec §8 require.
pub struct TestClock {
    nanos: AtomicU64,
    start: Instant,
}

impl TestClock {
    #[must_use]
    pub fn new() -> Self {
        TestClock {
            nanos: AtomicU64::new(1),
            start: Instant::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, AtomicOrdering::SeqCst);
    }

    pub fn set_nanos(&self, nanos: NanoTime) {
        self.nanos.store(nanos, AtomicOrdering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_nanos(&self) -> NanoTime {
        self.nanos.load(AtomicOrdering::SeqCst)
    }

    fn now(&self) -> Instant {
        self.start + Duration::from_nanos(self.now_nanos())
    }
}

/// Opaque handle to a scheduled timer, returned by [`TimerWheel::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    deadline: NanoTime,
    id: TimerId,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A deadline-ordered set of pending timers, generic over a small payload
/// identifying what the timer is for (e.g. a session id + timer kind).
///
/// `cancel` is O(n) (a tombstone set) rather than true removal from the
/// heap, which is the usual trade-off for a duty-cycle timer wheel: timers
/// are cancelled far less often than they are scheduled or polled.
pub struct TimerWheel<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: std::collections::HashSet<TimerId>,
    next_id: u64,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    #[must_use]
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            cancelled: std::collections::HashSet::new(),
            next_id: 1,
        }
    }

    /// Schedule `payload` to fire at `deadline` (nanoseconds on the same
    /// clock used to poll this wheel).
    pub fn schedule(&mut self, deadline: NanoTime, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry {
            deadline,
            id,
            payload,
        });
        id
    }

    /// Schedule a timer relative to `now` plus `interval`.
    pub fn schedule_after(&mut self, now: NanoTime, interval: Duration, payload: T) -> TimerId {
        self.schedule(now.saturating_add(interval.as_nanos() as u64), payload)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Pop every timer whose deadline is `<= now`, in deadline order,
    /// skipping cancelled ones.
    pub fn drain_expired(&mut self, now: NanoTime) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some");
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            fired.push((entry.id, entry.payload));
        }
        fired
    }

    /// Nanoseconds until the next (non-cancelled) deadline, if any.
    pub fn next_deadline(&self) -> Option<NanoTime> {
        self.heap.iter().map(|e| e.deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() <= self.cancelled.len()
    }
}

/// Strategy for what the Framer's thread does when a duty cycle found no
/// work — spec §5's "parks (via a configurable idle strategy) and re-polls".
pub trait IdleStrategy: Send + Sync {
    /// Called once per duty cycle with whether any work was done.
    fn idle(&self, work_done: bool);
}

/// Busy-spins for a handful of empty cycles, then sleeps briefly.
///
/// The default: low latency under load, bounded CPU burn when idle.
pub struct BackoffIdleStrategy {
    spin_budget: u32,
    sleep_for: Duration,
    idle_streak: AtomicU64,
}

impl BackoffIdleStrategy {
    #[must_use]
    pub fn new(spin_budget: u32, sleep_for: Duration) -> Self {
        BackoffIdleStrategy {
            spin_budget,
            sleep_for,
            idle_streak: AtomicU64::new(0),
        }
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&self, work_done: bool) {
        if work_done {
            self.idle_streak.store(0, AtomicOrdering::Relaxed);
            return;
        }
        let streak = self.idle_streak.fetch_add(1, AtomicOrdering::Relaxed);
        if streak as u32 > self.spin_budget {
            std::thread::sleep(self.sleep_for);
        } else {
            std::hint::spin_loop();
        }
    }
}

/// A clock shared across the Framer and whatever borrowed its handle (tests
/// mostly); cheap to clone, matching `services/server/src/state.rs`'s
/// preference for `Arc`-wrapped shared state over locks where the value
/// itself is immutable (its `Arc<RwLock<..>>` fields).
pub type SharedClock = Arc<dyn Clock>;

#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wheel_fires_in_deadline_order() {
        let mut wheel: TimerWheel<&'static str> = TimerWheel::new();
        wheel.schedule(30, "third");
        wheel.schedule(10, "first");
        wheel.schedule(20, "second");

        let fired = wheel.drain_expired(25);
        let payloads: Vec<_> = fired.into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec!["first", "second"]);
        assert_eq!(wheel.next_deadline(), Some(30));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let id = wheel.schedule(10, 1);
        wheel.cancel(id);
        assert!(wheel.drain_expired(100).is_empty());
    }

    #[test]
    fn test_clock_advances_only_when_told() {
        let clock = TestClock::new();
        let t0 = clock.now_nanos();
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_nanos(), t0 + 5_000_000);
    }
}
