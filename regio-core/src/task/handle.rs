use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const EXECUTING: u8 = 1;
const EXECUTING_CANCELLED: u8 = 2;
const FINISHED: u8 = 3;
const CANCELLED: u8 = 4;

/// Where a scheduled task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Waiting for its next run.
    Idle,
    /// Running right now.
    Running,
    /// Running right now, and cancelled for every later run.
    CancelledRunning,
    /// A one-shot task that has run.
    Finished,
    /// Will never run again.
    Cancelled,
}

/// The outcome of [`ScheduledTask::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelledState {
    /// The task had not started and now never will.
    CancelledByCaller,
    /// The task was already cancelled.
    CancelledAlready,
    /// A repeating task is running; this run completes but no later run happens.
    NextRunsCancelled,
    /// A repeating task is running and its later runs were already cancelled.
    NextRunsCancelledAlready,
    /// A one-shot task has already run.
    AlreadyExecuted,
    /// A one-shot task is running and can no longer be cancelled.
    Running,
}

struct TaskControl {
    state: AtomicU8,
    repeating: bool,
}

/// A handle to a delayed or repeating task, used to cancel it or observe it.
#[derive(Clone)]
pub struct ScheduledTask(Arc<TaskControl>);

impl ScheduledTask {
    pub(crate) fn new(repeating: bool) -> Self {
        Self(Arc::new(TaskControl {
            state: AtomicU8::new(IDLE),
            repeating,
        }))
    }

    /// Whether the task runs more than once.
    #[must_use]
    pub fn is_repeating(&self) -> bool {
        self.0.repeating
    }

    /// Prevents future runs.
    pub fn cancel(&self) -> CancelledState {
        loop {
            match self.0.state.load(Ordering::Acquire) {
                IDLE => {
                    if self.transition(IDLE, CANCELLED) {
                        return CancelledState::CancelledByCaller;
                    }
                }
                EXECUTING => {
                    if !self.0.repeating {
                        return CancelledState::Running;
                    }
                    if self.transition(EXECUTING, EXECUTING_CANCELLED) {
                        return CancelledState::NextRunsCancelled;
                    }
                }
                EXECUTING_CANCELLED => return CancelledState::NextRunsCancelledAlready,
                FINISHED => return CancelledState::AlreadyExecuted,
                _ => return CancelledState::CancelledAlready,
            }
        }
    }

    /// The current state.
    #[must_use]
    pub fn execution_state(&self) -> ExecutionState {
        match self.0.state.load(Ordering::Acquire) {
            IDLE => ExecutionState::Idle,
            EXECUTING => ExecutionState::Running,
            EXECUTING_CANCELLED => ExecutionState::CancelledRunning,
            FINISHED => ExecutionState::Finished,
            _ => ExecutionState::Cancelled,
        }
    }

    /// Whether the task will not run again because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.execution_state(),
            ExecutionState::Cancelled | ExecutionState::CancelledRunning
        )
    }

    /// Claims the task for a run. `false` means it was cancelled.
    pub(crate) fn begin_run(&self) -> bool {
        self.transition(IDLE, EXECUTING)
    }

    /// Ends a run. Returns whether the task should be scheduled again.
    pub(crate) fn end_run(&self) -> bool {
        if !self.0.repeating {
            self.0.state.store(FINISHED, Ordering::Release);
            return false;
        }
        if self.transition(EXECUTING, IDLE) {
            true
        } else {
            self.0.state.store(CANCELLED, Ordering::Release);
            false
        }
    }

    /// Marks the task cancelled without running it, e.g. when its scheduler halts.
    pub(crate) fn abandon(&self) {
        self.0.state.store(CANCELLED, Ordering::Release);
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("repeating", &self.0.repeating)
            .field("state", &self.execution_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_before_run() {
        let task = ScheduledTask::new(false);
        assert_eq!(task.cancel(), CancelledState::CancelledByCaller);
        assert_eq!(task.cancel(), CancelledState::CancelledAlready);
        assert!(!task.begin_run());
    }

    #[test]
    fn test_one_shot_lifecycle() {
        let task = ScheduledTask::new(false);
        assert!(task.begin_run());
        assert_eq!(task.cancel(), CancelledState::Running);
        assert!(!task.end_run());
        assert_eq!(task.execution_state(), ExecutionState::Finished);
        assert_eq!(task.cancel(), CancelledState::AlreadyExecuted);
    }

    #[test]
    fn test_repeating_cancel_during_run() {
        let task = ScheduledTask::new(true);
        assert!(task.begin_run());
        assert!(task.end_run());
        assert_eq!(task.execution_state(), ExecutionState::Idle);

        assert!(task.begin_run());
        assert_eq!(task.cancel(), CancelledState::NextRunsCancelled);
        assert_eq!(task.cancel(), CancelledState::NextRunsCancelledAlready);
        assert!(!task.end_run());
        assert_eq!(task.execution_state(), ExecutionState::Cancelled);
        assert!(task.is_cancelled());
    }
}
