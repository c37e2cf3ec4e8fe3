//! Units of work and how they retire.
//!
//! Every task either runs exactly once on the thread that owns its target, or is retired: its
//! retire callback runs instead. Retirement happens in `Drop`, so a task cannot be lost silently
//! no matter which path discards it (halted region, removed entity, exhausted retries).

mod handle;
mod queue;
mod retry;

pub use handle::{CancelledState, ExecutionState, ScheduledTask};
pub(crate) use queue::RegionTaskQueue;
pub use retry::{RetryDecision, RetryPolicy};

use std::mem;

use regio_utils::ChunkPos;

use crate::chunk::TicketGuard;
use crate::entity::EntityRef;
use crate::region::{EntityHandle, RegionContext};
use crate::scheduler::GlobalContext;

/// Runs instead of a task that can never run.
pub type RetireFn = Box<dyn FnOnce() + Send>;

pub(crate) type EntityTaskFn = Box<dyn FnOnce(EntityHandle<'_>) + Send>;

enum RegionWork {
    Once(Box<dyn FnOnce(&mut RegionContext) + Send>),
    Repeating {
        run: Box<dyn FnMut(&mut RegionContext) + Send>,
        period: u64,
    },
}

/// Work bound to a region.
///
/// An anchored task follows the region owning its anchor chunk through merges and splits; an
/// unanchored one stays with whichever region it was queued on.
pub(crate) struct RegionTask {
    work: Option<RegionWork>,
    retire: Option<RetireFn>,
    control: Option<ScheduledTask>,
    anchor: Option<ChunkPos>,
    delay: u64,
    // Released after the task runs or retires.
    _tickets: Vec<TicketGuard>,
}

impl RegionTask {
    pub(crate) fn once<F>(delay: u64, task: F) -> Self
    where
        F: FnOnce(&mut RegionContext) + Send + 'static,
    {
        Self::with_work(delay, RegionWork::Once(Box::new(task)))
    }

    pub(crate) fn repeating<F>(initial_delay: u64, period: u64, task: F) -> Self
    where
        F: FnMut(&mut RegionContext) + Send + 'static,
    {
        Self::with_work(
            initial_delay,
            RegionWork::Repeating {
                run: Box::new(task),
                period: period.max(1),
            },
        )
    }

    const fn with_work(delay: u64, work: RegionWork) -> Self {
        Self {
            work: Some(work),
            retire: None,
            control: None,
            anchor: None,
            delay,
            _tickets: Vec::new(),
        }
    }

    pub(crate) fn anchored(mut self, anchor: ChunkPos) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub(crate) fn retired_by(mut self, retire: Option<RetireFn>) -> Self {
        self.retire = retire;
        self
    }

    pub(crate) fn controlled_by(mut self, control: ScheduledTask) -> Self {
        self.control = Some(control);
        self
    }

    pub(crate) fn holding(mut self, tickets: Vec<TicketGuard>) -> Self {
        self._tickets = tickets;
        self
    }

    pub(crate) const fn anchor(&self) -> Option<ChunkPos> {
        self.anchor
    }

    /// Takes the remaining delay, leaving zero.
    pub(crate) const fn take_delay(&mut self) -> u64 {
        mem::replace(&mut self.delay, 0)
    }

    /// Runs the task. A repeating task that should run again is handed back with its period.
    pub(crate) fn run(mut self, ctx: &mut RegionContext) -> Option<(Self, u64)> {
        let work = self.work.take()?;
        if let Some(control) = &self.control
            && !control.begin_run()
        {
            // Cancelled by its owner, who already knows it will not run.
            self.retire = None;
            return None;
        }

        match work {
            RegionWork::Once(task) => {
                self.retire = None;
                task(ctx);
                if let Some(control) = &self.control {
                    control.end_run();
                }
                None
            }
            RegionWork::Repeating { mut run, period } => {
                run(ctx);
                if self.control.as_ref().is_none_or(ScheduledTask::end_run) {
                    self.work = Some(RegionWork::Repeating { run, period });
                    Some((self, period))
                } else {
                    self.retire = None;
                    None
                }
            }
        }
    }
}

impl Drop for RegionTask {
    fn drop(&mut self) {
        if self.work.is_none() {
            return;
        }
        if let Some(control) = &self.control {
            if control.is_cancelled() {
                return;
            }
            control.abandon();
        }
        match self.retire.take() {
            Some(retire) => retire(),
            None => log::debug!(
                "Dropping region task anchored at {:?} without running it",
                self.anchor
            ),
        }
    }
}

/// Work bound to an entity, wherever it currently lives.
pub(crate) struct EntityTask {
    entity: EntityRef,
    run: Option<EntityTaskFn>,
    retire: Option<RetireFn>,
    delay: u64,
    attempts: u32,
}

impl EntityTask {
    pub(crate) fn new(
        entity: EntityRef,
        delay: u64,
        run: EntityTaskFn,
        retire: Option<RetireFn>,
    ) -> Self {
        Self {
            entity,
            run: Some(run),
            retire,
            delay,
            attempts: 0,
        }
    }

    pub(crate) const fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Counts down one tick of delay. Returns `true` while the task must keep waiting.
    pub(crate) const fn wait_tick(&mut self) -> bool {
        if self.delay > 0 {
            self.delay -= 1;
            true
        } else {
            false
        }
    }

    /// Records a failed dispatch and returns the number of failures so far.
    pub(crate) const fn fail_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn run(mut self, handle: EntityHandle<'_>) {
        if let Some(run) = self.run.take() {
            self.retire = None;
            run(handle);
        }
    }
}

impl Drop for EntityTask {
    fn drop(&mut self) {
        if self.run.is_some()
            && let Some(retire) = self.retire.take()
        {
            retire();
        }
    }
}

enum GlobalWork {
    Once(Box<dyn FnOnce(&GlobalContext<'_>) + Send>),
    Repeating {
        run: Box<dyn FnMut(&GlobalContext<'_>) + Send>,
        period: u64,
    },
}

/// Work for the global tick.
pub(crate) struct GlobalTask {
    work: Option<GlobalWork>,
    control: Option<ScheduledTask>,
    delay: u64,
}

impl GlobalTask {
    pub(crate) fn once<F>(delay: u64, task: F) -> Self
    where
        F: FnOnce(&GlobalContext<'_>) + Send + 'static,
    {
        Self {
            work: Some(GlobalWork::Once(Box::new(task))),
            control: None,
            delay,
        }
    }

    pub(crate) fn repeating<F>(
        initial_delay: u64,
        period: u64,
        control: ScheduledTask,
        task: F,
    ) -> Self
    where
        F: FnMut(&GlobalContext<'_>) + Send + 'static,
    {
        Self {
            work: Some(GlobalWork::Repeating {
                run: Box::new(task),
                period: period.max(1),
            }),
            control: Some(control),
            delay: initial_delay,
        }
    }

    pub(crate) const fn take_delay(&mut self) -> u64 {
        mem::replace(&mut self.delay, 0)
    }

    pub(crate) fn run(mut self, ctx: &GlobalContext<'_>) -> Option<(Self, u64)> {
        let work = self.work.take()?;
        if let Some(control) = &self.control
            && !control.begin_run()
        {
            return None;
        }
        match work {
            GlobalWork::Once(task) => {
                task(ctx);
                if let Some(control) = &self.control {
                    control.end_run();
                }
                None
            }
            GlobalWork::Repeating { mut run, period } => {
                run(ctx);
                if self.control.as_ref().is_none_or(ScheduledTask::end_run) {
                    self.work = Some(GlobalWork::Repeating { run, period });
                    Some((self, period))
                } else {
                    None
                }
            }
        }
    }
}

impl Drop for GlobalTask {
    fn drop(&mut self) {
        if self.work.is_some()
            && let Some(control) = &self.control
        {
            control.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::entity::{Entity, EntityPosition};

    fn counting_retire(counter: &Arc<AtomicUsize>) -> Option<RetireFn> {
        let counter = counter.clone();
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_dropped_region_task_retires_once() {
        let retired = Arc::new(AtomicUsize::new(0));
        let task = RegionTask::once(0, |_| {}).retired_by(counting_retire(&retired));
        drop(task);
        assert_eq!(retired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_task_does_not_retire() {
        let retired = Arc::new(AtomicUsize::new(0));
        let control = ScheduledTask::new(true);
        let task = RegionTask::repeating(0, 5, |_| {})
            .retired_by(counting_retire(&retired))
            .controlled_by(control.clone());
        control.cancel();
        drop(task);
        assert_eq!(retired.load(Ordering::SeqCst), 0);
        assert_eq!(control.execution_state(), ExecutionState::Cancelled);
    }

    #[test]
    fn test_entity_task_delay_counts_down() {
        let entity = Entity::new(
            Uuid::new_v4(),
            "sheep".to_owned(),
            EntityPosition::default(),
            None,
        );
        let retired = Arc::new(AtomicUsize::new(0));
        let mut task = EntityTask::new(
            entity.reference().clone(),
            2,
            Box::new(|_| {}),
            counting_retire(&retired),
        );
        assert!(task.wait_tick());
        assert!(task.wait_tick());
        assert!(!task.wait_tick());
        assert_eq!(task.fail_attempt(), 1);
        drop(task);
        assert_eq!(retired.load(Ordering::SeqCst), 1);
    }
}
