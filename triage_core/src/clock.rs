//! The simulation clock - delayed and repeating actions with a speed multiplier.
//!
//! The clock does not own a thread or a timer source. It is advanced
//! explicitly (`advance_to`) against the environment's monotonic time and
//! hands back the actions that came due, in deadline order. The caller then
//! dispatches them on the scheduling thread, so actions never run
//! concurrently with each other or with the tick that fired them.
//!
//! # Speed
//!
//! Every duration passed to `after`/`every` is divided by the speed
//! multiplier *at scheduling time*. Changing the speed does not rescale
//! timers that are already pending; a repeating timer picks up the new speed
//! when it re-arms.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TriageError;

/// Smallest period a repeating timer re-arms with, so a zero interval cannot
/// fire unboundedly within a single advance.
const MIN_REPEAT_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a scheduled action. Cancelling a stale handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Once,
    /// Unscaled interval; scaled again on every re-arm
    Repeating(Duration),
}

#[derive(Debug)]
struct Timer<A> {
    handle: TimerHandle,
    kind: TimerKind,
    action: A,
}

/// Ordering key: deadline first, then scheduling sequence.
type TimerKey = (Duration, u64);

/// Discrete timer queue with a global speed multiplier.
#[derive(Debug)]
pub struct Clock<A> {
    /// Time of the last advance
    now: Duration,

    /// Divisor applied to newly scheduled durations
    speed: f64,

    /// Pending timers ordered by (deadline, sequence)
    timers: BTreeMap<TimerKey, Timer<A>>,

    /// Handle -> key, for cancellation
    index: HashMap<TimerHandle, TimerKey>,

    next_handle: u64,
    next_seq: u64,
}

impl<A: Clone> Clock<A> {
    /// Creates a clock at time zero with speed 1.
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    /// Creates a clock whose current time is `now`.
    pub fn starting_at(now: Duration) -> Self {
        Self {
            now,
            speed: 1.0,
            timers: BTreeMap::new(),
            index: HashMap::new(),
            next_handle: 0,
            next_seq: 0,
        }
    }

    /// Returns the time of the last advance.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Returns the current speed multiplier.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Sets the speed multiplier for durations scheduled from now on.
    pub fn set_speed(&mut self, multiplier: f64) -> Result<(), TriageError> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(TriageError::InvalidSpeed(multiplier));
        }
        self.speed = multiplier;
        Ok(())
    }

    /// Converts a wall duration into a simulated one at the current speed.
    pub fn scale(&self, duration: Duration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() / self.speed).unwrap_or(Duration::MAX)
    }

    /// Schedules `action` once after `duration`.
    ///
    /// A zero duration fires on the next advance.
    pub fn after(&mut self, duration: Duration, action: A) -> TimerHandle {
        let deadline = self.now.saturating_add(self.scale(duration));
        self.insert(deadline, TimerKind::Once, action)
    }

    /// Schedules `action` every `interval`, first firing one interval from now.
    pub fn every(&mut self, interval: Duration, action: A) -> TimerHandle {
        let deadline = self.now.saturating_add(self.scale(interval).max(MIN_REPEAT_PERIOD));
        self.insert(deadline, TimerKind::Repeating(interval), action)
    }

    /// Cancels a pending timer. Returns false if it had already fired or
    /// been cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.index.remove(&handle) {
            Some(key) => self.timers.remove(&key).is_some(),
            None => false,
        }
    }

    /// Cancels every pending timer.
    pub fn cancel_all(&mut self) {
        self.timers.clear();
        self.index.clear();
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Returns true if the handle refers to a pending timer.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.index.contains_key(&handle)
    }

    /// Time left until a pending timer fires.
    pub fn remaining(&self, handle: TimerHandle) -> Option<Duration> {
        self.index
            .get(&handle)
            .map(|(deadline, _)| deadline.saturating_sub(self.now))
    }

    /// Advances by `elapsed` and returns the actions that came due.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<A> {
        let target = self.now.saturating_add(elapsed);
        self.advance_to(target)
    }

    /// Advances to `target` and returns the actions that came due, in
    /// deadline order (ties in scheduling order).
    ///
    /// Repeating timers that fall due several times within the span fire
    /// once per period. A target in the past only fires already-due timers.
    pub fn advance_to(&mut self, target: Duration) -> Vec<A> {
        let target = target.max(self.now);
        let mut fired = Vec::new();

        loop {
            let key = match self.timers.first_key_value() {
                Some((key, _)) if key.0 <= target => *key,
                _ => break,
            };
            let Some(timer) = self.timers.remove(&key) else {
                break;
            };
            self.index.remove(&timer.handle);
            self.now = self.now.max(key.0);

            match timer.kind {
                TimerKind::Once => fired.push(timer.action),
                TimerKind::Repeating(interval) => {
                    fired.push(timer.action.clone());
                    let period = self.scale(interval).max(MIN_REPEAT_PERIOD);
                    let seq = self.bump_seq();
                    let next_key = (key.0.saturating_add(period), seq);
                    self.index.insert(timer.handle, next_key);
                    self.timers.insert(next_key, timer);
                }
            }
        }

        self.now = target;
        fired
    }

    fn insert(&mut self, deadline: Duration, kind: TimerKind, action: A) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let key = (deadline, self.bump_seq());
        self.index.insert(handle, key);
        self.timers.insert(
            key,
            Timer {
                handle,
                kind,
                action,
            },
        );
        handle
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl<A: Clone> Default for Clock<A> {
    fn default() -> Self {
        Self::new()
    }
}
