// src/motion/poll.rs - Fixed-interval polling with an iteration budget and cooperative stop
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// When the first iteration fires relative to the start of polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    /// Wait one interval before every iteration, including the first.
    Delayed,
    /// Run the first iteration at once, then wait one interval between iterations.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub budget: u32,
    pub first_tick: FirstTick,
}

impl PollSchedule {
    pub fn delayed(interval: Duration, budget: u32) -> Self {
        Self {
            interval,
            budget,
            first_tick: FirstTick::Delayed,
        }
    }

    pub fn immediate(interval: Duration, budget: u32) -> Self {
        Self {
            interval,
            budget,
            first_tick: FirstTick::Immediate,
        }
    }
}

/// Drives a poll loop:
///
/// ```ignore
/// let mut poller = Poller::new(schedule, stop);
/// while let Some(iteration) = poller.tick().await {
///     if done(iteration).await { break; }
/// }
/// ```
///
/// `tick` yields the zero-based iteration index until the budget is spent or the
/// stop flag is raised. The stop flag is checked both before and after each wait.
#[derive(Debug)]
pub struct Poller {
    schedule: PollSchedule,
    stop: Arc<AtomicBool>,
    next: u32,
    cancelled: bool,
}

impl Poller {
    pub fn new(schedule: PollSchedule, stop: Arc<AtomicBool>) -> Self {
        Self {
            schedule,
            stop,
            next: 0,
            cancelled: false,
        }
    }

    pub async fn tick(&mut self) -> Option<u32> {
        if self.next >= self.schedule.budget || self.check_stop() {
            return None;
        }

        let wait = self.next > 0 || self.schedule.first_tick == FirstTick::Delayed;
        if wait {
            tokio::time::sleep(self.schedule.interval).await;
            if self.check_stop() {
                return None;
            }
        }

        let iteration = self.next;
        self.next += 1;
        Some(iteration)
    }

    fn check_stop(&mut self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            self.cancelled = true;
        }
        self.cancelled
    }

    /// Iterations handed out so far.
    pub fn iterations(&self) -> u32 {
        self.next
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.schedule.budget
    }
}

/// Sleep for `duration` in steps of at most `step`, returning `false` if the stop
/// flag was raised before the full duration elapsed.
pub async fn hold(duration: Duration, step: Duration, stop: &AtomicBool) -> bool {
    let step = step.max(Duration::from_millis(1));
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(step);
        tokio::time::sleep(slice).await;
        remaining -= slice;
    }
    !stop.load(Ordering::SeqCst)
}
