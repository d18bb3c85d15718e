//! Time sources and timers driving entry expiry.
//!
//! The [`CoalescingCache`](super::CoalescingCache) never reads the wall clock or spawns timers on
//! its own. It asks a [`Clock`] for the current time, and an [`ExpiryScheduler`] to run the
//! removal of an entry once its time-to-live has elapsed. Production code uses [`TokioClock`] and
//! [`TokioScheduler`], tests can swap in [`ManualClock`] and [`ManualScheduler`] to control time
//! precisely.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::utils::futures::{CallOnDrop, lock};

/// A source of the current time.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// A task run by an [`ExpiryScheduler`] once its deadline is reached.
pub type ExpiryTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks at a later point in time.
pub trait ExpiryScheduler: Send + Sync + 'static {
    /// Schedules `task` to run once `deadline` is reached.
    ///
    /// The task may also run right away, before `schedule` returns. Dropping the returned
    /// [`TimerHandle`] cancels the task, unless it already ran.
    fn schedule(&self, deadline: Instant, task: ExpiryTask) -> TimerHandle;
}

/// Handle to a scheduled [`ExpiryTask`].
///
/// The task is cancelled when the handle is dropped.
#[derive(Debug)]
pub struct TimerHandle {
    _cancel: CallOnDrop,
}

impl TimerHandle {
    /// Creates a handle which calls `cancel` when dropped.
    pub fn new<F: FnOnce() + Send + 'static>(cancel: F) -> Self {
        Self {
            _cancel: CallOnDrop::new(cancel),
        }
    }
}

/// A [`Clock`] based on [`tokio::time::Instant`].
///
/// Outside of tests this is the monotonic system clock. Inside of tests using
/// [`tokio::time::pause`], it follows tokio's virtual time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// An [`ExpiryScheduler`] that spawns one sleeping task per timer on the current tokio runtime.
///
/// # Panics
///
/// Scheduling panics when called outside of a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl ExpiryScheduler for TokioScheduler {
    fn schedule(&self, deadline: Instant, task: ExpiryTask) -> TimerHandle {
        let deadline = tokio::time::Instant::from_std(deadline);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task();
        });
        TimerHandle::new(move || handle.abort())
    }
}

/// A [`Clock`] that only moves when explicitly told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a clock frozen at `start`.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *lock(&self.now) += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

type TimerQueue = BTreeMap<(Instant, u64), ExpiryTask>;

/// An [`ExpiryScheduler`] whose timers only fire when asked to.
///
/// Timers are due once the paired [`ManualClock`] reaches their deadline. They run in deadline
/// order on [`run_due`](Self::run_due) or [`advance`](Self::advance).
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    timers: Arc<Mutex<TimerQueue>>,
    next_id: Arc<AtomicU64>,
}

impl ManualScheduler {
    /// Creates a scheduler driven by `clock`.
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            timers: Default::default(),
            next_id: Default::default(),
        }
    }

    /// Returns the clock driving this scheduler.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Moves the clock forward by `duration` and runs all the timers that became due.
    pub fn advance(&self, duration: Duration) -> usize {
        self.clock.advance(duration);
        self.run_due()
    }

    /// Runs all timers whose deadline has been reached, returning how many ran.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now();
        let mut ran = 0;
        loop {
            // Tasks run without holding the lock, as they may schedule new timers.
            let task = {
                let mut timers = lock(&self.timers);
                let is_due = timers
                    .first_key_value()
                    .is_some_and(|(&(deadline, _), _)| deadline <= now);
                if is_due {
                    timers.pop_first().map(|(_, task)| task)
                } else {
                    None
                }
            };
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Returns the number of timers which are still waiting for their deadline.
    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("clock", &self.clock)
            .field("pending", &self.pending())
            .finish()
    }
}

impl ExpiryScheduler for ManualScheduler {
    fn schedule(&self, deadline: Instant, task: ExpiryTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.timers).insert((deadline, id), task);

        let timers: Weak<Mutex<TimerQueue>> = Arc::downgrade(&self.timers);
        TimerHandle::new(move || {
            if let Some(timers) = timers.upgrade() {
                // The task is dropped outside of the lock, it may own handles itself.
                let task = lock(&timers).remove(&(deadline, id));
                drop(task);
            }
        })
    }
}
