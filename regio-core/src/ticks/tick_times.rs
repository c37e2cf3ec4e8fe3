//! Rolling tick timing windows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Aggregated timings over one window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickReport {
    /// Ticks started inside the window.
    pub tick_count: usize,
    /// Ticks per second over the covered span.
    pub tps: f64,
    /// Mean milliseconds per tick.
    pub mspt_avg: f64,
    /// Longest tick in milliseconds.
    pub mspt_max: f64,
    /// Fraction of wall time spent ticking, from 0 to 1 per thread.
    pub utilisation: f64,
}

#[derive(Debug, Clone, Copy)]
struct TickSample {
    start: Instant,
    duration: Duration,
}

/// Tick samples kept for a fixed retention period.
#[derive(Debug)]
pub struct TickTimes {
    samples: VecDeque<TickSample>,
    retention: Duration,
    total_ticks: u64,
}

impl TickTimes {
    /// Window used for the short report.
    pub const SHORT_WINDOW: Duration = Duration::from_secs(15);
    /// Window used for the long report, and the default retention.
    pub const LONG_WINDOW: Duration = Duration::from_secs(60);

    /// Creates an empty history keeping samples for `retention`.
    #[must_use]
    pub const fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
            total_ticks: 0,
        }
    }

    /// Records a finished tick.
    pub fn record(&mut self, start: Instant, end: Instant) {
        self.samples.push_back(TickSample {
            start,
            duration: end.saturating_duration_since(start),
        });
        self.total_ticks += 1;
        while let Some(front) = self.samples.front() {
            if end.saturating_duration_since(front.start) > self.retention {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Ticks recorded since creation, including expired samples.
    #[must_use]
    pub const fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Duration of the most recent tick.
    #[must_use]
    pub fn last_duration(&self) -> Option<Duration> {
        self.samples.back().map(|sample| sample.duration)
    }

    /// Moves every sample of `other` into this history, keeping start order.
    pub fn absorb(&mut self, other: &Self) {
        let mut merged: Vec<TickSample> = self.samples.drain(..).collect();
        merged.extend(other.samples.iter().copied());
        merged.sort_by_key(|sample| sample.start);
        self.samples = merged.into();
        self.total_ticks += other.total_ticks;
    }

    /// Summarises the samples that started within `window` of `now`.
    #[must_use]
    pub fn report(&self, now: Instant, window: Duration) -> TickReport {
        let in_window = self
            .samples
            .iter()
            .filter(|sample| now.saturating_duration_since(sample.start) <= window);

        let mut count = 0usize;
        let mut busy = Duration::ZERO;
        let mut longest = Duration::ZERO;
        let mut earliest: Option<Instant> = None;
        for sample in in_window {
            count += 1;
            busy += sample.duration;
            longest = longest.max(sample.duration);
            earliest = Some(earliest.map_or(sample.start, |e| e.min(sample.start)));
        }

        let Some(earliest) = earliest else {
            return TickReport::default();
        };
        let span = now
            .saturating_duration_since(earliest)
            .max(Duration::from_millis(1))
            .as_secs_f64();

        TickReport {
            tick_count: count,
            tps: count as f64 / span,
            mspt_avg: busy.as_secs_f64() * 1000.0 / count as f64,
            mspt_max: longest.as_secs_f64() * 1000.0,
            utilisation: (busy.as_secs_f64() / span).min(1.0),
        }
    }
}

impl Default for TickTimes {
    fn default() -> Self {
        Self::new(Self::LONG_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_steady_ticks() {
        let base = Instant::now();
        let mut times = TickTimes::default();
        // 20 ticks, 50ms apart, 10ms each.
        for i in 0..20u64 {
            let start = base + Duration::from_millis(i * 50);
            times.record(start, start + Duration::from_millis(10));
        }

        let now = base + Duration::from_millis(1000);
        let report = times.report(now, TickTimes::SHORT_WINDOW);
        assert_eq!(report.tick_count, 20);
        assert!((report.tps - 20.0).abs() < 0.01);
        assert!((report.mspt_avg - 10.0).abs() < 0.01);
        assert!((report.utilisation - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_old_samples_expire() {
        let base = Instant::now();
        let mut times = TickTimes::new(Duration::from_secs(1));
        times.record(base, base + Duration::from_millis(5));
        let later = base + Duration::from_secs(3);
        times.record(later, later + Duration::from_millis(5));

        assert_eq!(times.report(later, Duration::from_secs(60)).tick_count, 1);
        assert_eq!(times.total_ticks(), 2);
    }

    #[test]
    fn test_empty_report() {
        let times = TickTimes::default();
        assert_eq!(times.report(Instant::now(), TickTimes::LONG_WINDOW).tick_count, 0);
    }
}
