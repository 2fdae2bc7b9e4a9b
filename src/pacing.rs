use std::time::Duration;

use crate::clock::Clock;

/// Spreads `total` operations evenly over `duration`.
///
/// Operation `k` (1-based) is due at `start + k/total * duration`. Waiting for
/// an operation that is already late returns immediately, so a slow consumer
/// never causes the pacer to sleep past its schedule.
#[derive(Debug, Clone)]
pub struct Pacer<C: Clock> {
    clock: C,
    start_ns: u64,
    total: u64,
    duration: Duration,
}

impl<C: Clock> Pacer<C> {
    /// Starts the schedule at the clock's current reading.
    pub fn new(clock: C, total: u64, duration: Duration) -> Self {
        let start_ns = clock.now_ns();
        Self::starting_at(clock, start_ns, total, duration)
    }

    pub fn starting_at(clock: C, start_ns: u64, total: u64, duration: Duration) -> Self {
        Self {
            clock,
            start_ns,
            total,
            duration,
        }
    }

    pub fn is_active(&self) -> bool {
        self.total > 0 && !self.duration.is_zero()
    }

    /// Offset from the start at which operation `index` is due.
    pub fn ideal_offset(&self, index: u64) -> Duration {
        if !self.is_active() {
            return Duration::ZERO;
        }
        let nanos = self.duration.as_nanos() * u128::from(index) / u128::from(self.total);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// How long the caller would have to sleep right now for operation `index`.
    pub fn delay_for(&self, index: u64) -> Duration {
        if !self.is_active() {
            return Duration::ZERO;
        }
        let due_ns = self
            .start_ns
            .saturating_add(u64::try_from(self.ideal_offset(index).as_nanos()).unwrap_or(u64::MAX));
        Duration::from_nanos(due_ns.saturating_sub(self.clock.now_ns()))
    }

    /// Blocks until operation `index` is due.
    pub fn wait(&self, index: u64) {
        let delay = self.delay_for(index);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}
