use std::time::Duration;

use crate::scheduler::{RealTimeScheduler, TimerHandle};

/// One-shot timer slot. Re-arming cancels the previous deadline, so at most one is live.
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<TimerHandle>,
}

impl Timer {
    pub fn arm<E>(&mut self, sched: &mut RealTimeScheduler<E>, event: E, delay: Duration) {
        self.cancel(sched);
        self.handle = Some(sched.schedule(event, delay));
    }

    pub fn cancel<E>(&mut self, sched: &mut RealTimeScheduler<E>) {
        if let Some(handle) = self.handle.take() {
            sched.cancel(handle);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `handle` is this timer's live deadline; the timer is disarmed.
    pub fn fired(&mut self, handle: TimerHandle) -> bool {
        if self.handle == Some(handle) {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ClockMode;

    #[test]
    fn rearm_replaces_deadline() {
        let mut sched = RealTimeScheduler::new(ClockMode::Virtual);
        let mut timer = Timer::default();
        timer.arm(&mut sched, "first", Duration::from_secs(1));
        timer.arm(&mut sched, "second", Duration::from_secs(3));

        let (handle, event) = sched.advance().unwrap();
        assert_eq!(event, "second");
        assert!(timer.fired(handle));
        assert!(!timer.is_armed());
        assert!(sched.advance().is_none());
    }

    #[test]
    fn foreign_handle_is_ignored() {
        let mut sched = RealTimeScheduler::new(ClockMode::Virtual);
        let mut a = Timer::default();
        let mut b = Timer::default();
        a.arm(&mut sched, (), Duration::from_secs(1));
        b.arm(&mut sched, (), Duration::from_secs(2));
        let (handle, _) = sched.advance().unwrap();
        assert!(!b.fired(handle));
        assert!(b.is_armed());
        assert!(a.fired(handle));
    }
}
