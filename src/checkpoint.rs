//! Lifecycle checkpoints and the statistics derived from them.

use std::time::Duration;

use hdrhistogram::Histogram;

use crate::clock::{Clock, QuantaClock};
use crate::config::StatsCategories;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Run started.
    Begin,
    /// Connection established.
    Connected,
    /// Session opened.
    SessionOpen,
    /// Link attached; transfers may start.
    LinkReady,
    /// One message processed. Repeats per message.
    Message,
    /// Resources closed.
    End,
}

impl Phase {
    pub fn code(self) -> char {
        match self {
            Phase::Begin => 'B',
            Phase::Connected => 'C',
            Phase::SessionOpen => 'D',
            Phase::LinkReady => 'E',
            Phase::Message => 'F',
            Phase::End => 'G',
        }
    }

    fn repeats(self) -> bool {
        self == Phase::Message
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub phase: Phase,
    pub at_ns: u64,
}

/// Whether rate figures are meaningful for the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportMode {
    /// Completed run: include rate and throughput.
    Full,
    /// Aborted run: phase deltas only.
    Partial,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencySummary {
    pub samples: u64,
    pub mean: Duration,
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

/// Figures derived from a checkpoint sequence. Absent phases leave the
/// corresponding fields empty.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSummary {
    pub elapsed: Option<Duration>,
    pub connect: Option<Duration>,
    pub session: Option<Duration>,
    pub link: Option<Duration>,
    pub transfer: Option<Duration>,
    pub messages: Option<u64>,
    /// Messages per second.
    pub rate: Option<f64>,
    /// Content bytes per second.
    pub throughput: Option<f64>,
    pub latency: Option<LatencySummary>,
}

/// Ordered record of checkpoints for one run.
#[derive(Debug)]
pub struct CheckpointRecorder<C: Clock = QuantaClock> {
    clock: C,
    categories: StatsCategories,
    checkpoints: Vec<Checkpoint>,
}

impl<C: Clock> CheckpointRecorder<C> {
    pub fn with_clock(categories: StatsCategories, clock: C) -> Self {
        Self {
            clock,
            categories,
            checkpoints: Vec::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn endpoints_enabled(&self) -> bool {
        self.categories.endpoints
    }

    /// Appends `phase` at the current time when statistics are enabled.
    ///
    /// Non-repeating phases are kept at their first occurrence.
    pub fn record(&mut self, phase: Phase) -> bool {
        if !self.categories.stats {
            return false;
        }
        if !phase.repeats() && self.first(phase).is_some() {
            log::debug!("checkpoint {} already recorded", phase.code());
            return false;
        }
        self.checkpoints.push(Checkpoint {
            phase,
            at_ns: self.clock.now_ns(),
        });
        true
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    fn first(&self, phase: Phase) -> Option<u64> {
        self.checkpoints
            .iter()
            .find(|cp| cp.phase == phase)
            .map(|cp| cp.at_ns)
    }

    fn last(&self, phase: Phase) -> Option<u64> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.phase == phase)
            .map(|cp| cp.at_ns)
    }

    fn delta(&self, from: Phase, to: Phase) -> Option<Duration> {
        let start = self.first(from)?;
        let end = if to.repeats() {
            self.last(to)?
        } else {
            self.first(to)?
        };
        Some(Duration::from_nanos(end.saturating_sub(start)))
    }

    /// Derives the summary for `count` messages of `content_size` bytes.
    ///
    /// Returns `None` when nothing was recorded.
    pub fn report(&self, count: u64, content_size: usize, mode: ReportMode) -> Option<StatsSummary> {
        if self.checkpoints.is_empty() {
            return None;
        }
        let mut summary = StatsSummary {
            elapsed: self.delta(Phase::Begin, Phase::End),
            connect: self.delta(Phase::Begin, Phase::Connected),
            session: self.delta(Phase::Connected, Phase::SessionOpen),
            link: self.delta(Phase::SessionOpen, Phase::LinkReady),
            transfer: self.delta(Phase::LinkReady, Phase::Message),
            latency: self.latency(),
            ..StatsSummary::default()
        };

        if mode == ReportMode::Full {
            summary.messages = Some(count);
            if let Some(elapsed) = summary.elapsed.filter(|elapsed| !elapsed.is_zero()) {
                let secs = elapsed.as_secs_f64();
                summary.rate = Some(count as f64 / secs);
                summary.throughput = Some(count as f64 * content_size as f64 / secs);
            }
        }
        Some(summary)
    }

    /// Gaps between consecutive message checkpoints, the first measured from
    /// link readiness when available.
    fn latency(&self) -> Option<LatencySummary> {
        let mut histogram = Histogram::<u64>::new(3).ok()?;
        let mut previous = self.first(Phase::LinkReady);
        let mut total = 0u64;
        for cp in self.checkpoints.iter().filter(|cp| cp.phase == Phase::Message) {
            if let Some(prev) = previous {
                let gap = cp.at_ns.saturating_sub(prev);
                histogram.saturating_record(gap);
                total = total.saturating_add(gap);
            }
            previous = Some(cp.at_ns);
        }
        let samples = histogram.len();
        if samples == 0 {
            return None;
        }
        Some(LatencySummary {
            samples,
            mean: Duration::from_nanos(total / samples),
            p50: Duration::from_nanos(histogram.value_at_quantile(0.5)),
            p99: Duration::from_nanos(histogram.value_at_quantile(0.99)),
            max: Duration::from_nanos(histogram.max()),
        })
    }
}
