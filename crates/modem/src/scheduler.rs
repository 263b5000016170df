//! Timer queue driving the modem state machine.
//!
//! Events are kept in a min-heap ordered by due time. The clock either follows the wall
//! clock or is virtual and only moves when the next event is taken.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Time advances straight to the next due event.
    Virtual,
    #[default]
    WallClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

struct Scheduled<E> {
    due: Duration,
    handle: TimerHandle,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.handle == other.handle
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap; equal due times fire in scheduling order
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

pub struct RealTimeScheduler<E> {
    mode: ClockMode,
    origin: Instant,
    virtual_now: Duration,
    queue: BinaryHeap<Scheduled<E>>,
    cancelled: HashSet<TimerHandle>,
    next_handle: u64,
}

impl<E> RealTimeScheduler<E> {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            origin: Instant::now(),
            virtual_now: Duration::ZERO,
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_handle: 0,
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Time since the scheduler was created.
    pub fn clock(&self) -> Duration {
        match self.mode {
            ClockMode::Virtual => self.virtual_now,
            ClockMode::WallClock => self.origin.elapsed(),
        }
    }

    pub fn schedule(&mut self, event: E, delay: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let due = self.clock() + delay;
        trace!("timer {:?} due at {:?}", handle, due);
        self.queue.push(Scheduled { due, handle, event });
        handle
    }

    /// Cancelling a timer that already fired is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if self.queue.iter().any(|s| s.handle == handle) {
            self.cancelled.insert(handle);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len() - self.cancelled.len()
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.queue.peek() {
            if !self.cancelled.remove(&top.handle) {
                break;
            }
            self.queue.pop();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.queue.peek().map(|s| s.due)
    }

    /// Wall-clock instant of a deadline returned by [`Self::next_deadline`].
    pub fn instant_of(&self, due: Duration) -> Instant {
        self.origin + due
    }

    /// Takes the earliest event if it is due now.
    pub fn pop_due(&mut self) -> Option<(TimerHandle, E)> {
        let due = self.next_deadline()?;
        if due > self.clock() {
            return None;
        }
        self.queue.pop().map(|s| (s.handle, s.event))
    }

    /// Virtual mode: moves the clock to the earliest event and takes it.
    /// Wall-clock mode behaves like [`Self::pop_due`].
    pub fn advance(&mut self) -> Option<(TimerHandle, E)> {
        if self.mode == ClockMode::Virtual {
            let due = self.next_deadline()?;
            self.virtual_now = self.virtual_now.max(due);
        }
        self.pop_due()
    }
}
