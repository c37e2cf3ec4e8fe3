//! Chunk holder bookkeeping: tickets, load state and the load pipeline.
//!
//! Holders live in a fixed number of mutex-guarded shards so that ticket updates for unrelated
//! columns never contend. Loads run on the chunk I/O runtime; when one finishes, the column is
//! handed to the global tick thread, which assigns it to a region before anyone waiting on the load
//! is woken.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use futures::FutureExt;
use futures::future;
use regio_utils::ChunkPos;
use regio_utils::locks::{SyncMutex, SyncRwLock};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::{task, time};

use super::{
    ChunkData, ChunkGenerator, ChunkHolder, ChunkHolderInfo, ChunkLevel, ChunkLoad,
    ChunkLoadFuture, ChunkLoadState, EntityRecord, LoadSender, PendingLoad, Ticket, TicketType,
};
use crate::chunk_saver::ChunkStorage;
use crate::config::SchedulerConfig;
use crate::error::{ChunkIoError, ChunkLoadError};
use crate::region::RegionHandle;
use crate::regionizer::Topology;
use crate::scheduler::ControlCommand;
use crate::ticks::{DelayedQueue, TaskPriority};

const SHARD_COUNT: usize = 64;

/// Identifies one ticket so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketHandle {
    pos: ChunkPos,
    id: u64,
}

impl TicketHandle {
    /// The column the ticket is on.
    #[must_use]
    pub const fn pos(&self) -> ChunkPos {
        self.pos
    }
}

/// Removes its ticket when dropped.
pub struct TicketGuard {
    manager: Arc<ChunkHolderManager>,
    handle: TicketHandle,
}

impl TicketGuard {
    /// The guarded ticket.
    #[must_use]
    pub const fn handle(&self) -> TicketHandle {
        self.handle
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.manager.remove_ticket(self.handle);
    }
}

/// Counts one piece of background work on the I/O runtime until dropped.
struct IoWork(Arc<ChunkHolderManager>);

impl IoWork {
    fn start(manager: &Arc<ChunkHolderManager>) -> Self {
        manager.pending_io.fetch_add(1, Ordering::AcqRel);
        Self(manager.clone())
    }
}

impl Drop for IoWork {
    fn drop(&mut self) {
        self.0.pending_io.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadSettings {
    max_concurrent: usize,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
    unload_delay: u64,
    request_ticket_ticks: u64,
}

/// Owns every chunk holder and drives loads and unloads.
pub struct ChunkHolderManager {
    shards: Box<[SyncMutex<FxHashMap<ChunkPos, ChunkHolder>>]>,
    next_ticket: AtomicU64,
    queue: SyncMutex<DelayedQueue<ChunkPos>>,
    in_flight: AtomicUsize,
    pending_io: AtomicUsize,
    settings: LoadSettings,
    storage: Arc<ChunkStorage>,
    generator: Arc<dyn ChunkGenerator>,
    io: Handle,
    control: Sender<ControlCommand>,
    topology: Arc<SyncRwLock<Topology>>,
    global_tick: Arc<AtomicU64>,
}

impl ChunkHolderManager {
    pub(crate) fn new(
        config: &SchedulerConfig,
        storage: Arc<ChunkStorage>,
        generator: Arc<dyn ChunkGenerator>,
        io: Handle,
        control: Sender<ControlCommand>,
        topology: Arc<SyncRwLock<Topology>>,
        global_tick: Arc<AtomicU64>,
    ) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| SyncMutex::new(FxHashMap::default()))
                .collect(),
            next_ticket: AtomicU64::new(1),
            queue: SyncMutex::new(DelayedQueue::new()),
            in_flight: AtomicUsize::new(0),
            pending_io: AtomicUsize::new(0),
            settings: LoadSettings {
                max_concurrent: config.max_concurrent_loads,
                timeout: Duration::from_millis(config.load_timeout_ms),
                retries: config.io_retries,
                backoff: Duration::from_millis(config.io_retry_backoff_ms),
                unload_delay: config.unload_delay_ticks,
                request_ticket_ticks: config.request_ticket_ticks,
            },
            storage,
            generator,
            io,
            control,
            topology,
            global_tick,
        }
    }

    fn shard(&self, pos: ChunkPos) -> &SyncMutex<FxHashMap<ChunkPos, ChunkHolder>> {
        let hash = (pos.as_i64() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.shards[(hash >> 58) as usize % SHARD_COUNT]
    }

    fn now(&self) -> u64 {
        self.global_tick.load(Ordering::Acquire)
    }

    /// Adds a ticket and starts loading the column if it is not resident.
    pub fn add_ticket(
        self: &Arc<Self>,
        pos: ChunkPos,
        ticket_type: TicketType,
        level: ChunkLevel,
    ) -> TicketHandle {
        self.add_ticket_inner(pos, ticket_type, level, None, TaskPriority::Normal)
            .0
    }

    /// Like [`ChunkHolderManager::add_ticket`], but the ticket is removed when the guard drops.
    pub fn add_ticket_guarded(
        self: &Arc<Self>,
        pos: ChunkPos,
        ticket_type: TicketType,
        level: ChunkLevel,
    ) -> TicketGuard {
        let handle = self.add_ticket(pos, ticket_type, level);
        TicketGuard {
            manager: self.clone(),
            handle,
        }
    }

    fn add_ticket_inner(
        self: &Arc<Self>,
        pos: ChunkPos,
        ticket_type: TicketType,
        level: ChunkLevel,
        expires_at: Option<u64>,
        priority: TaskPriority,
    ) -> (TicketHandle, ChunkLoadFuture) {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (future, enqueued) = {
            let mut shard = self.shard(pos).lock();
            let holder = shard.entry(pos).or_insert_with(|| ChunkHolder::new(pos));
            holder.add_ticket(Ticket {
                id,
                ticket_type,
                level,
                expires_at,
            });
            self.ensure_loading(pos, holder, priority)
        };
        if enqueued {
            self.pump();
        }
        (TicketHandle { pos, id }, future)
    }

    /// Removes a ticket. Returns `false` if it was already gone.
    ///
    /// The column stays resident for the configured unload delay after its last ticket goes.
    pub fn remove_ticket(&self, handle: TicketHandle) -> bool {
        let now = self.now();
        let mut shard = self.shard(handle.pos).lock();
        shard
            .get_mut(&handle.pos)
            .is_some_and(|holder| holder.remove_ticket(handle.id, now))
    }

    /// Asks for a column to be loaded to at least `level`.
    ///
    /// The request places a short-lived ticket; hold a real ticket to keep the column loaded.
    pub fn request_load(
        self: &Arc<Self>,
        pos: ChunkPos,
        level: ChunkLevel,
        priority: TaskPriority,
    ) -> ChunkLoadFuture {
        let expires_at = self.now() + self.settings.request_ticket_ticks.max(1);
        self.add_ticket_inner(pos, TicketType::Request, level, Some(expires_at), priority)
            .1
    }

    /// The load outcome of a column, starting a load if needed. Places no ticket.
    pub fn load_future(self: &Arc<Self>, pos: ChunkPos) -> ChunkLoadFuture {
        let (future, enqueued) = {
            let mut shard = self.shard(pos).lock();
            let holder = shard.entry(pos).or_insert_with(|| ChunkHolder::new(pos));
            self.ensure_loading(pos, holder, TaskPriority::Normal)
        };
        if enqueued {
            self.pump();
        }
        future
    }

    fn ensure_loading(
        &self,
        pos: ChunkPos,
        holder: &mut ChunkHolder,
        priority: TaskPriority,
    ) -> (ChunkLoadFuture, bool) {
        match holder.state {
            ChunkLoadState::Loaded => {
                let result = self
                    .resolve_owner(pos)
                    .map(|owner| ChunkLoad { pos, owner })
                    .ok_or(ChunkLoadError::Cancelled);
                (future::ready(result).boxed().shared(), false)
            }
            ChunkLoadState::Failed => (
                future::ready(Err(ChunkLoadError::PermanentlyFailed(pos)))
                    .boxed()
                    .shared(),
                false,
            ),
            ChunkLoadState::Loading | ChunkLoadState::Saving => {
                // A load requested while saving starts once the save completes.
                let pending = holder.load.get_or_insert_with(PendingLoad::new);
                (pending.future.clone(), false)
            }
            ChunkLoadState::Unloaded => {
                let pending = holder.load.get_or_insert_with(PendingLoad::new);
                let future = pending.future.clone();
                holder.state = ChunkLoadState::Loading;
                self.queue.lock().schedule_with_priority(pos, 0, priority);
                (future, true)
            }
        }
    }

    /// Starts queued loads while below the concurrency limit.
    fn pump(self: &Arc<Self>) {
        loop {
            let max = self.settings.max_concurrent;
            if self
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_err()
            {
                return;
            }
            let next = self.queue.lock().pop_due(0);
            let Some(pos) = next else {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return;
            };
            let sender = self
                .shard(pos)
                .lock()
                .get_mut(&pos)
                .and_then(|holder| holder.load.as_mut())
                .and_then(|pending| pending.sender.take());
            let Some(sender) = sender else {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                continue;
            };

            let manager = self.clone();
            self.io.spawn(async move {
                let result = manager.clone().load_column(pos).await;
                manager.complete_load(pos, sender, result);
                manager.in_flight.fetch_sub(1, Ordering::AcqRel);
                manager.pump();
            });
        }
    }

    async fn load_column(self: Arc<Self>, pos: ChunkPos) -> Result<ChunkLoad, ChunkLoadError> {
        let data = time::timeout(self.settings.timeout, self.read_or_generate(pos))
            .await
            .map_err(|_| ChunkLoadError::TimedOut(pos))??;

        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlCommand::ChunkLoaded { data, reply })
            .map_err(|_| ChunkLoadError::ShuttingDown)?;
        response.await.unwrap_or(Err(ChunkLoadError::ShuttingDown))
    }

    async fn read_or_generate(&self, pos: ChunkPos) -> Result<ChunkData, ChunkLoadError> {
        let mut attempt = 0u32;
        loop {
            let result = match self.storage.load_chunk(pos).await {
                Ok(Some(data)) => Ok(data),
                Ok(None) => self.generate(pos).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    log::warn!("Retrying load of chunk {pos} (attempt {attempt}): {err}");
                    time::sleep(self.settings.backoff * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn generate(&self, pos: ChunkPos) -> Result<ChunkData, ChunkIoError> {
        let generator = self.generator.clone();
        match task::spawn_blocking(move || generator.generate(pos)).await {
            Ok(result) => result,
            Err(err) => Err(ChunkIoError::Corrupt {
                pos,
                message: format!("generator failed: {err}"),
            }),
        }
    }

    fn complete_load(
        &self,
        pos: ChunkPos,
        sender: LoadSender,
        result: Result<ChunkLoad, ChunkLoadError>,
    ) {
        {
            let now = self.now();
            let mut shard = self.shard(pos).lock();
            if let Some(holder) = shard.get_mut(&pos) {
                holder.load = None;
                holder.state = match &result {
                    Ok(_) => {
                        if holder.level().is_none() && holder.ticketless_since.is_none() {
                            holder.ticketless_since = Some(now);
                        }
                        ChunkLoadState::Loaded
                    }
                    Err(ChunkLoadError::Io(err)) if !err.is_transient() => {
                        log::error!("Chunk {pos} failed to load and will not be retried: {err}");
                        ChunkLoadState::Failed
                    }
                    Err(err) => {
                        log::warn!("Loading chunk {pos} did not complete: {err}");
                        ChunkLoadState::Unloaded
                    }
                };
            }
        }
        let _ = sender.send(result);
    }

    /// The region owning a loaded column.
    #[must_use]
    pub fn resolve_owner(&self, pos: ChunkPos) -> Option<RegionHandle> {
        self.topology.read().owner(pos).cloned()
    }

    /// The load state of a column.
    #[must_use]
    pub fn state(&self, pos: ChunkPos) -> ChunkLoadState {
        self.shard(pos)
            .lock()
            .get(&pos)
            .map_or(ChunkLoadState::Unloaded, |holder| holder.state)
    }

    /// The bookkeeping of a column, if it has a holder.
    #[must_use]
    pub fn info(&self, pos: ChunkPos) -> Option<ChunkHolderInfo> {
        self.shard(pos).lock().get(&pos).map(ChunkHolder::info)
    }

    /// Number of columns with a holder.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Loads currently running.
    #[must_use]
    pub fn loads_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Loads waiting for a free slot.
    #[must_use]
    pub fn loads_queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Expires tickets, restarts loads for ticketed columns that are not resident, drops idle
    /// holders and returns the columns whose unload delay has passed.
    pub(crate) fn process_tick(self: &Arc<Self>, now: u64) -> Vec<ChunkPos> {
        let mut unload = Vec::new();
        let mut restarted = false;
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|pos, holder| {
                holder.expire_tickets(now);
                match holder.state {
                    ChunkLoadState::Loaded => {
                        if holder.level().is_none()
                            && !holder.unload_queued
                            && holder
                                .ticketless_since
                                .is_some_and(|since| now >= since + self.settings.unload_delay)
                        {
                            holder.unload_queued = true;
                            unload.push(*pos);
                        }
                        true
                    }
                    ChunkLoadState::Unloaded => {
                        if holder.level().is_some() || holder.load.is_some() {
                            let _ = self.ensure_loading(*pos, holder, TaskPriority::Normal);
                            restarted = true;
                            true
                        } else {
                            false
                        }
                    }
                    ChunkLoadState::Loading
                    | ChunkLoadState::Saving
                    | ChunkLoadState::Failed => true,
                }
            });
        }
        if restarted {
            self.pump();
        }
        unload
    }

    /// Called by the owning region before it gives up a column. Returns `false` if the column
    /// gained a ticket in the meantime and must stay.
    pub(crate) fn begin_unload(&self, pos: ChunkPos) -> bool {
        let mut shard = self.shard(pos).lock();
        let Some(holder) = shard.get_mut(&pos) else {
            return false;
        };
        holder.unload_queued = false;
        if holder.state != ChunkLoadState::Loaded || holder.level().is_some() {
            return false;
        }
        holder.state = ChunkLoadState::Saving;
        true
    }

    /// Called by the global tick thread once an unloaded column left the topology. Reloads it if
    /// someone asked for it while it was saving.
    pub(crate) fn finish_unload(self: &Arc<Self>, pos: ChunkPos, result: Result<(), ChunkIoError>) {
        if let Err(err) = result {
            log::error!("Failed to save chunk {pos}: {err}");
        }
        self.finish_write(pos);
    }

    fn finish_write(self: &Arc<Self>, pos: ChunkPos) {
        let reload = {
            let mut shard = self.shard(pos).lock();
            let Some(holder) = shard.get_mut(&pos) else {
                return;
            };
            holder.state = ChunkLoadState::Unloaded;
            holder.ticketless_since = None;
            if holder.level().is_some() || holder.load.is_some() {
                self.ensure_loading(pos, holder, TaskPriority::Normal).1
            } else {
                false
            }
        };
        if reload {
            self.pump();
        }
    }

    /// Writes a column back on the I/O runtime, then hands it to the global tick thread to be
    /// dropped from the topology.
    pub(crate) fn save_and_release(self: &Arc<Self>, data: ChunkData) {
        let manager = self.clone();
        self.io.spawn(async move {
            let pos = data.pos;
            let result = manager.storage.save_chunk(data).await;
            manager.release(pos, result);
        });
    }

    /// Like [`ChunkHolderManager::save_and_release`] for a column that has nothing to save.
    pub(crate) fn release_unsaved(self: &Arc<Self>, pos: ChunkPos) {
        self.release(pos, Ok(()));
    }

    fn release(self: &Arc<Self>, pos: ChunkPos, result: Result<(), ChunkIoError>) {
        if let Err(ControlCommand::ChunkReleased { pos, result }) = self
            .control
            .send(ControlCommand::ChunkReleased { pos, result })
            .map_err(|err| err.0)
        {
            self.finish_unload(pos, result);
        }
    }

    /// Writes columns back and waits for the writes. Used while halting, from the region's thread.
    pub(crate) fn save_blocking(&self, chunks: Vec<ChunkData>) {
        let storage = self.storage.clone();
        let saves = chunks.into_iter().map(|data| {
            let storage = storage.clone();
            async move {
                let pos = data.pos;
                (pos, storage.save_chunk(data).await)
            }
        });
        let results = self.io.block_on(future::join_all(saves));
        for (pos, result) in results {
            if let Err(err) = result {
                log::error!("Failed to save chunk {pos} during shutdown: {err}");
            }
            if let Some(holder) = self.shard(pos).lock().get_mut(&pos) {
                holder.state = ChunkLoadState::Unloaded;
            }
        }
    }

    /// Runs `work` on the I/O runtime, counted until it finishes or is dropped.
    pub(crate) fn spawn_tracked<F>(self: &Arc<Self>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tracker = IoWork::start(self);
        self.io.spawn(async move {
            work.await;
            drop(tracker);
        });
    }

    /// Waits until no load and no tracked work is running. Returns `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0
                && self.pending_io.load(Ordering::Acquire) == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Marks an unloaded column as being written so no load reads it meanwhile. Returns `false`
    /// if the column is resident or busy.
    pub(crate) fn begin_entity_write(&self, pos: ChunkPos) -> bool {
        let mut shard = self.shard(pos).lock();
        let holder = shard.entry(pos).or_insert_with(|| ChunkHolder::new(pos));
        if holder.state != ChunkLoadState::Unloaded {
            return false;
        }
        holder.state = ChunkLoadState::Saving;
        true
    }

    /// Appends entities to a stored column. The column must have been marked with
    /// [`ChunkHolderManager::begin_entity_write`].
    pub(crate) fn write_entities(self: &Arc<Self>, pos: ChunkPos, records: Vec<EntityRecord>) {
        let manager = self.clone();
        self.spawn_tracked(async move {
            let count = records.len();
            if let Err(err) = manager.append_entities(pos, records).await {
                log::error!("Lost {count} entities bound for chunk {pos}: {err}");
            }
            manager.finish_write(pos);
        });
    }

    /// Appends entities to stored columns and waits for the writes. Used while halting, once no
    /// region is left.
    pub(crate) fn write_entities_blocking(&self, batches: Vec<(ChunkPos, Vec<EntityRecord>)>) {
        let writes = batches.into_iter().map(|(pos, records)| async move {
            let count = records.len();
            (pos, count, self.append_entities(pos, records).await)
        });
        let results = self.io.block_on(future::join_all(writes));
        for (pos, count, result) in results {
            match result {
                Ok(()) => log::debug!("Saved {count} entities into chunk {pos}"),
                Err(err) => log::error!("Lost {count} entities bound for chunk {pos}: {err}"),
            }
        }
    }

    async fn append_entities(
        &self,
        pos: ChunkPos,
        records: Vec<EntityRecord>,
    ) -> Result<(), ChunkIoError> {
        let mut data = match self.storage.load_chunk(pos).await? {
            Some(data) => data,
            None => self.generate(pos).await?,
        };
        data.entities.extend(records);
        self.storage.save_chunk(data).await
    }

    /// Resolves every load that has not started with [`ChunkLoadError::ShuttingDown`].
    pub(crate) fn fail_pending(&self) {
        *self.queue.lock() = DelayedQueue::new();
        for shard in &self.shards {
            for holder in shard.lock().values_mut() {
                if let Some(sender) = holder.load.as_mut().and_then(|p| p.sender.take()) {
                    let _ = sender.send(Err(ChunkLoadError::ShuttingDown));
                    holder.load = None;
                    if holder.state == ChunkLoadState::Loading {
                        holder.state = ChunkLoadState::Unloaded;
                    }
                }
            }
        }
    }

    /// Flushes and closes the storage backend.
    pub(crate) fn close_storage(&self) {
        let storage = self.storage.clone();
        if let Err(err) = self.io.block_on(async move { storage.close_all().await }) {
            log::error!("Failed to close chunk storage: {err}");
        }
    }
}
