use std::time::Instant;

/// A monotonic source of timestamps for checkpoints and pacing.
///
/// Timestamps are nanoseconds relative to an arbitrary per-clock origin, so
/// only differences between readings of the same clock are meaningful.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now_ns(&self) -> u64;
}

/// A clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A clock that uses the CPU's Time-Stamp Counter (TSC) via the `quanta` crate.
///
/// Cheaper to read than `Instant` on hot paths such as per-message checkpoints.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let origin = clock.now();
        Self { clock, origin }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_ns(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.origin);
        u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX)
    }
}
