//! Scheduler configuration.
//!
//! The configuration is a plain value handed to [`crate::scheduler::RegionScheduler::start`]. There
//! is no global instance, so tests can run several schedulers with different settings side by side.
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Every tunable the scheduler reads. Missing keys fall back to [`SchedulerConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target ticks per second for every region and the global tick.
    pub tick_rate: u32,
    /// How many missed ticks a region may run back to back before its schedule is reset.
    pub max_catchup_ticks: u32,
    /// Tick worker threads started up front. 0 picks a value from the core count.
    pub tick_threads: usize,
    /// Upper bound the pool may grow to when many regions are live. 0 means twice `tick_threads`.
    pub max_tick_threads: usize,
    /// Extra workers above `tick_threads` exit after idling this long.
    pub idle_worker_timeout_ms: u64,
    /// log2 of the section side length in chunks.
    pub section_shift: u8,
    /// Empty sections kept around every non-empty section, in sections.
    pub buffer_radius: i32,
    /// Regions whose non-empty sections are within this many sections become merge candidates.
    pub merge_radius: i32,
    /// Consecutive global ticks two regions must stay merge candidates before merging.
    pub merge_ticks: u32,
    /// Non-empty sections further apart than this belong in separate regions.
    pub split_distance: i32,
    /// Consecutive global ticks a region must stay splittable before splitting.
    pub split_ticks: u32,
    /// Chunk loads allowed in flight at once.
    pub max_concurrent_loads: usize,
    /// Worker threads of the chunk I/O runtime.
    pub io_threads: usize,
    /// A single load attempt fails with a timeout after this long.
    pub load_timeout_ms: u64,
    /// Retries for transient storage errors.
    pub io_retries: u32,
    /// Base backoff between storage retries. Multiplied by the attempt number.
    pub io_retry_backoff_ms: u64,
    /// Global ticks a loaded chunk stays resident after its last ticket goes away.
    pub unload_delay_ticks: u64,
    /// Lifetime in global ticks of the ticket placed by an explicit load request.
    pub request_ticket_ticks: u64,
    /// Global ticks between redispatch attempts of an entity task that could not run.
    pub retry_interval_ticks: u64,
    /// Give up on an entity task after this many failed dispatches. `None` retries until the
    /// entity is removed.
    pub max_entity_task_attempts: Option<u32>,
    /// A tick running longer than this is reported as slow.
    pub warn_after_ms: u64,
    /// Minimum time between two slow tick reports for the same region.
    pub warn_interval_ms: u64,
    /// A tick running longer than this is treated as hung and escalated.
    pub crash_after_ms: u64,
    /// Consecutive overrunning ticks before a region is reported as falling behind.
    pub overrun_warn_ticks: u32,
    /// How often the cached server status is rebuilt.
    pub status_interval_ms: u64,
    /// How often the watchdog samples running ticks.
    pub watchdog_interval_ms: u64,
}

impl SchedulerConfig {
    /// Checks the invariants the regionizer and the pool rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.tick_rate) {
            return Err(ConfigError::Invalid("tick_rate must be in range 1..=1000"));
        }
        if !(1..=10).contains(&self.section_shift) {
            return Err(ConfigError::Invalid("section_shift must be in range 1..=10"));
        }
        if self.buffer_radius < 1 {
            return Err(ConfigError::Invalid("buffer_radius must be at least 1"));
        }
        if self.merge_radius < 2 * self.buffer_radius {
            return Err(ConfigError::Invalid(
                "merge_radius must be at least twice buffer_radius",
            ));
        }
        if self.split_distance < self.merge_radius {
            return Err(ConfigError::Invalid(
                "split_distance must not be smaller than merge_radius",
            ));
        }
        if self.max_concurrent_loads == 0 || self.io_threads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_loads and io_threads must be positive",
            ));
        }
        if self.tick_threads != 0
            && self.max_tick_threads != 0
            && self.max_tick_threads < self.tick_threads
        {
            return Err(ConfigError::Invalid(
                "max_tick_threads must not be smaller than tick_threads",
            ));
        }
        if self.warn_after_ms >= self.crash_after_ms {
            return Err(ConfigError::Invalid(
                "warn_after_ms must be smaller than crash_after_ms",
            ));
        }
        if self.retry_interval_ticks == 0 {
            return Err(ConfigError::Invalid("retry_interval_ticks must be positive"));
        }
        Ok(())
    }

    /// Wall time of one tick.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    /// Worker threads to start with.
    #[must_use]
    pub fn resolved_tick_threads(&self) -> usize {
        if self.tick_threads != 0 {
            return self.tick_threads;
        }
        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let half = cores / 2;
        if half <= 4 { 1 } else { half / 4 }
    }

    /// Largest size the worker pool may reach.
    #[must_use]
    pub fn resolved_max_tick_threads(&self) -> usize {
        let base = self.resolved_tick_threads();
        if self.max_tick_threads == 0 {
            base * 2
        } else {
            self.max_tick_threads.max(base)
        }
    }

    /// Largest radius a chunk-affine task may cover and still land in a single region.
    #[must_use]
    pub const fn max_task_radius(&self) -> i32 {
        self.buffer_radius << self.section_shift
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            max_catchup_ticks: 5,
            tick_threads: 0,
            max_tick_threads: 0,
            idle_worker_timeout_ms: 30_000,
            section_shift: 4,
            buffer_radius: 1,
            merge_radius: 3,
            merge_ticks: 20,
            split_distance: 4,
            split_ticks: 100,
            max_concurrent_loads: 32,
            io_threads: 2,
            load_timeout_ms: 30_000,
            io_retries: 3,
            io_retry_backoff_ms: 50,
            unload_delay_ticks: 100,
            request_ticket_ticks: 20,
            retry_interval_ticks: 1,
            max_entity_task_attempts: None,
            warn_after_ms: 10_000,
            warn_interval_ms: 5_000,
            crash_after_ms: 60_000,
            overrun_warn_ticks: 100,
            status_interval_ms: 5_000,
            watchdog_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_merge_radius_must_cover_buffers() {
        let config = SchedulerConfig {
            buffer_radius: 2,
            merge_radius: 3,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_distance_at_least_merge_radius() {
        let config = SchedulerConfig {
            merge_radius: 5,
            split_distance: 4,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json5_uses_defaults() {
        let config: SchedulerConfig =
            serde_json5::from_str("{ tick_rate: 10, section_shift: 3 }").expect("valid json5");
        assert_eq!(config.tick_rate, 10);
        assert_eq!(config.section_shift, 3);
        assert_eq!(config.buffer_radius, SchedulerConfig::default().buffer_radius);
        assert_eq!(config.tick_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_max_task_radius() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_task_radius(), 16);
    }
}
