use std::collections::VecDeque;
use std::mem;

use regio_utils::locks::SyncMutex;

use super::{EntityTask, RegionTask};
use crate::region::RegionHandle;

enum Route {
    Open,
    // The region was merged away; everything goes to the survivor.
    Forward(RegionHandle),
    Closed,
}

struct QueueInner {
    region_tasks: VecDeque<RegionTask>,
    entity_tasks: VecDeque<EntityTask>,
    route: Route,
}

/// Tasks submitted to a region from other threads, drained at the start of each tick.
pub(crate) struct RegionTaskQueue {
    inner: SyncMutex<QueueInner>,
}

/// Everything a queue held when it was drained.
#[derive(Default)]
pub(crate) struct DrainedTasks {
    pub(crate) region_tasks: VecDeque<RegionTask>,
    pub(crate) entity_tasks: VecDeque<EntityTask>,
}

impl RegionTaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: SyncMutex::new(QueueInner {
                region_tasks: VecDeque::new(),
                entity_tasks: VecDeque::new(),
                route: Route::Open,
            }),
        }
    }

    /// Queues a task. Hands it back if the region is gone for good.
    pub(crate) fn push_region(&self, task: RegionTask) -> Result<(), RegionTask> {
        let mut inner = self.inner.lock();
        match &inner.route {
            Route::Open => {
                inner.region_tasks.push_back(task);
                Ok(())
            }
            Route::Forward(target) => {
                let target = target.clone();
                drop(inner);
                target.queue().push_region(task)
            }
            Route::Closed => Err(task),
        }
    }

    /// Queues an entity task. Hands it back if the region is gone for good.
    pub(crate) fn push_entity(&self, task: EntityTask) -> Result<(), EntityTask> {
        let mut inner = self.inner.lock();
        match &inner.route {
            Route::Open => {
                inner.entity_tasks.push_back(task);
                Ok(())
            }
            Route::Forward(target) => {
                let target = target.clone();
                drop(inner);
                target.queue().push_entity(task)
            }
            Route::Closed => Err(task),
        }
    }

    /// Takes everything queued so far, in submission order.
    pub(crate) fn drain(&self) -> DrainedTasks {
        let mut inner = self.inner.lock();
        DrainedTasks {
            region_tasks: mem::take(&mut inner.region_tasks),
            entity_tasks: mem::take(&mut inner.entity_tasks),
        }
    }

    /// Redirects all future submissions to `target` and returns what was already queued.
    pub(crate) fn forward_to(&self, target: RegionHandle) -> DrainedTasks {
        let mut inner = self.inner.lock();
        inner.route = Route::Forward(target);
        DrainedTasks {
            region_tasks: mem::take(&mut inner.region_tasks),
            entity_tasks: mem::take(&mut inner.entity_tasks),
        }
    }

    /// Rejects all future submissions and returns what was already queued.
    pub(crate) fn close(&self) -> DrainedTasks {
        let mut inner = self.inner.lock();
        inner.route = Route::Closed;
        DrainedTasks {
            region_tasks: mem::take(&mut inner.region_tasks),
            entity_tasks: mem::take(&mut inner.entity_tasks),
        }
    }

    /// Number of queued tasks of both kinds.
    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.region_tasks.len() + inner.entity_tasks.len()
    }
}
