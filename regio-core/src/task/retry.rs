use crate::config::SchedulerConfig;

/// What to do with an entity task that could not run where it was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this many global ticks.
    RetryAfter(u64),
    /// Stop trying and retire the task.
    GiveUp,
}

/// Redispatch policy for entity tasks whose entity is between regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Global ticks between attempts.
    pub interval_ticks: u64,
    /// Retire after this many failed dispatches. `None` keeps trying until the entity is removed.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Builds the policy from the scheduler configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            interval_ticks: config.retry_interval_ticks.max(1),
            max_attempts: config.max_entity_task_attempts,
        }
    }

    /// Decides the fate of a task that has failed `attempts` dispatches so far.
    #[must_use]
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        match self.max_attempts {
            Some(max) if attempts >= max => RetryDecision::GiveUp,
            _ => RetryDecision::RetryAfter(self.interval_ticks),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_policy_keeps_retrying() {
        let policy = RetryPolicy {
            interval_ticks: 2,
            max_attempts: None,
        };
        assert_eq!(policy.decide(10_000), RetryDecision::RetryAfter(2));
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let policy = RetryPolicy {
            interval_ticks: 1,
            max_attempts: Some(3),
        };
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(1));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }
}
