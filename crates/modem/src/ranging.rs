use std::collections::HashMap;
use std::time::Duration;

use seabridge_core::NodeAddr;

/// Nominal speed of sound in sea water, metres per second.
pub const SOUND_SPEED: f64 = 1500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEstimate {
    /// One-way propagation delay.
    pub propagation: Duration,
    /// Scheduler clock when it was measured.
    pub measured_at: Duration,
}

impl RangeEstimate {
    pub fn distance_m(&self) -> f64 {
        self.propagation.as_secs_f64() * SOUND_SPEED
    }
}

/// Last measured propagation delay per peer. Entries older than `max_age` read as unknown.
#[derive(Debug, Default)]
pub struct RoundTripTable {
    entries: HashMap<NodeAddr, RangeEstimate>,
    max_age: Option<Duration>,
}

impl RoundTripTable {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
        }
    }

    pub fn update(&mut self, peer: NodeAddr, propagation: Duration, now: Duration) {
        self.entries.insert(
            peer,
            RangeEstimate {
                propagation,
                measured_at: now,
            },
        );
    }

    fn fresh(&self, estimate: &RangeEstimate, now: Duration) -> bool {
        match self.max_age {
            Some(max) => now.saturating_sub(estimate.measured_at) <= max,
            None => true,
        }
    }

    pub fn get(&self, peer: NodeAddr, now: Duration) -> Option<RangeEstimate> {
        self.entries
            .get(&peer)
            .copied()
            .filter(|e| self.fresh(e, now))
    }

    /// Drops stale entries, returning how many went.
    pub fn prune(&mut self, now: Duration) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries.retain(|_, e| match max_age {
            Some(max) => now.saturating_sub(e.measured_at) <= max,
            None => true,
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_expire() {
        let mut table = RoundTripTable::new(Some(Duration::from_secs(60)));
        table.update(4, Duration::from_millis(400), Duration::from_secs(10));

        let est = table.get(4, Duration::from_secs(70)).unwrap();
        assert!((est.distance_m() - 600.0).abs() < 1e-9);
        assert!(table.get(4, Duration::from_secs(71)).is_none());
        assert!(table.get(5, Duration::from_secs(10)).is_none());

        assert_eq!(table.prune(Duration::from_secs(71)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn newer_measurement_replaces_older() {
        let mut table = RoundTripTable::new(None);
        table.update(4, Duration::from_millis(400), Duration::ZERO);
        table.update(4, Duration::from_millis(300), Duration::from_secs(1000));
        assert_eq!(table.len(), 1);
        let est = table.get(4, Duration::from_secs(1_000_000)).unwrap();
        assert_eq!(est.propagation, Duration::from_millis(300));
    }
}
