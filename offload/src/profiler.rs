use std::fmt;
use std::time::Duration;

use quanta::{Clock, Instant};

/// Wall-clock dispatch latency accumulated across iterations.
pub struct Profiler {
    clock: Clock,
    samples: Vec<Duration>,
    total: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileReport {
    pub iterations: u64,
    pub total: Duration,
    pub average: Duration,
    pub samples: Vec<Duration>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            samples: Vec::new(),
            total: Duration::ZERO,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn on_iteration_complete(&mut self, start: Instant, end: Instant) -> Duration {
        let delta = end.saturating_duration_since(start);
        self.total += delta;
        self.samples.push(delta);
        delta
    }

    pub fn iterations(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// `None` until at least one iteration has been recorded.
    pub fn report(&self) -> Option<ProfileReport> {
        let n = u32::try_from(self.samples.len()).ok().filter(|&n| n > 0)?;
        Some(ProfileReport {
            iterations: n as u64,
            total: self.total,
            average: self.total / n,
            samples: self.samples.clone(),
        })
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} iteration(s), total {:.3} ms, average {:.3} ms",
            self.iterations,
            self.total.as_secs_f64() * 1e3,
            self.average.as_secs_f64() * 1e3
        )
    }
}
