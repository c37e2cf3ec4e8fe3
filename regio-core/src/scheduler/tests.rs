//! Scenarios run against a live scheduler with a fast tick rate.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use futures::FutureExt;
use futures::executor::block_on;
use futures::future::{self, BoxFuture};
use regio_utils::ChunkPos;
use regio_utils::locks::SyncMutex;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use super::*;
use crate::chunk::{ChunkData, ChunkGenerator, ChunkLoad, ChunkLoadState, TicketHandle};
use crate::chunk_saver::{ChunkIo, ChunkStorage};
use crate::entity::{Entity, EntityPosition};
use crate::error::{ChunkIoError, ChunkLoadError};
use crate::network::{ConnectionId, OutboundBatch, OutboundPacket};

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_rate: 100,
        tick_threads: 2,
        max_tick_threads: 4,
        merge_ticks: 2,
        split_ticks: 3,
        unload_delay_ticks: 5,
        request_ticket_ticks: 5,
        status_interval_ms: 20,
        watchdog_interval_ms: 50,
        ..SchedulerConfig::default()
    }
}

/// Halts the scheduler when the test ends, pass or fail.
struct TestServer(RegionScheduler);

impl TestServer {
    fn start() -> Self {
        Self::start_with(Services::default())
    }

    fn start_with(services: Services) -> Self {
        Self::start_configured(test_config(), services)
    }

    fn start_configured(config: SchedulerConfig, services: Services) -> Self {
        let services = match services.fatal {
            FatalPolicy::ExitProcess { .. } => services.with_fatal(FatalPolicy::HaltScheduler),
            _ => services,
        };
        Self(RegionScheduler::start(config, services).expect("scheduler starts"))
    }
}

impl Deref for TestServer {
    type Target = RegionScheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.0.halt(true);
    }
}

#[derive(Clone, Default)]
struct SharedStorage(Arc<SyncMutex<FxHashMap<ChunkPos, ChunkData>>>);

impl SharedStorage {
    fn saved(&self, pos: ChunkPos) -> Option<ChunkData> {
        self.0.lock().get(&pos).cloned()
    }
}

impl ChunkIo for SharedStorage {
    fn load_chunk(
        &self,
        pos: ChunkPos,
    ) -> BoxFuture<'static, Result<Option<ChunkData>, ChunkIoError>> {
        let saved = self.saved(pos);
        future::ready(Ok(saved)).boxed()
    }

    fn save_chunk(&self, data: ChunkData) -> BoxFuture<'static, Result<(), ChunkIoError>> {
        self.0.lock().insert(data.pos, data);
        future::ready(Ok(())).boxed()
    }

    fn close_all(&self) -> BoxFuture<'static, Result<(), ChunkIoError>> {
        future::ready(Ok(())).boxed()
    }
}

/// Fails the first `failures` loads, as corrupt or transient, then behaves like [`SharedStorage`].
struct FailingStorage {
    inner: SharedStorage,
    failures: AtomicUsize,
    corrupt: bool,
    loads: AtomicUsize,
}

impl FailingStorage {
    fn new(failures: usize, corrupt: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: SharedStorage::default(),
            failures: AtomicUsize::new(failures),
            corrupt,
            loads: AtomicUsize::new(0),
        })
    }
}

impl ChunkIo for FailingStorage {
    fn load_chunk(
        &self,
        pos: ChunkPos,
    ) -> BoxFuture<'static, Result<Option<ChunkData>, ChunkIoError>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failing {
            return self.inner.load_chunk(pos);
        }
        let message = "disk unavailable".to_owned();
        let err = if self.corrupt {
            ChunkIoError::Corrupt { pos, message }
        } else {
            ChunkIoError::Transient { pos, message }
        };
        future::ready(Err(err)).boxed()
    }

    fn save_chunk(&self, data: ChunkData) -> BoxFuture<'static, Result<(), ChunkIoError>> {
        self.inner.save_chunk(data)
    }

    fn close_all(&self) -> BoxFuture<'static, Result<(), ChunkIoError>> {
        self.inner.close_all()
    }
}

/// Takes `delay` to generate `slow`; every other column is instant.
struct SlowGenerator {
    slow: ChunkPos,
    delay: Duration,
}

impl ChunkGenerator for SlowGenerator {
    fn generate(&self, pos: ChunkPos) -> Result<ChunkData, ChunkIoError> {
        if pos == self.slow {
            thread::sleep(self.delay);
        }
        Ok(ChunkData::empty(pos))
    }
}

fn shared_storage_services(storage: &SharedStorage) -> Services {
    Services::default().with_storage(ChunkStorage::External(Arc::new(storage.clone())))
}

struct ChannelSink(Sender<(ConnectionId, Vec<OutboundPacket>)>);

impl PacketSink for ChannelSink {
    fn flush(&self, _region: RegionId, batch: OutboundBatch) {
        for (connection, packets) in batch.into_connections() {
            let _ = self.0.send((connection, packets));
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Keeps a column loaded with a forced ticket and waits for it.
fn load(server: &RegionScheduler, pos: ChunkPos) -> (TicketHandle, ChunkLoad) {
    let ticket = server
        .chunks()
        .add_ticket(pos, TicketType::Forced, ChunkLevel::Border);
    let load = block_on(server.chunks().load_future(pos)).expect("chunk loads");
    (ticket, load)
}

/// Runs `task` on the owner of `pos` and returns its result.
fn run_on<T, F>(server: &RegionScheduler, pos: ChunkPos, task: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&mut RegionContext) -> T + Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    server
        .schedule_for_region(RegionHint::Chunk(pos), 0, move |ctx| {
            let _ = tx.send(task(ctx));
        })
        .expect("task accepted");
    rx.recv_timeout(TIMEOUT).expect("task ran")
}

fn middle_of(pos: ChunkPos) -> EntityPosition {
    EntityPosition::new(
        f64::from(pos.x() * 16) + 8.0,
        64.0,
        f64::from(pos.z() * 16) + 8.0,
    )
}

fn owner_id(server: &RegionScheduler, pos: ChunkPos) -> Option<RegionId> {
    server.resolve_owner(pos).map(|region| region.id())
}

#[test]
fn test_chunk_task_runs_after_area_loads() {
    let server = TestServer::start();
    let pos = ChunkPos::new(0, 0);
    let (tx, rx) = channel::bounded(1);
    server
        .schedule_for_chunk(
            ChunkTaskSpec::new(pos, 1, ChunkLevel::Border),
            0,
            move |ctx| {
                let _ = tx.send((ctx.id(), ctx.owns_chunk(pos), ctx.chunk_positions().count()));
            },
            None,
        )
        .expect("task accepted");

    let (region, owns, count) = rx.recv_timeout(TIMEOUT).expect("task ran");
    assert!(owns);
    assert_eq!(count, 9);
    assert_eq!(owner_id(&server, pos), Some(region));
    assert_eq!(owner_id(&server, ChunkPos::new(-1, -1)), Some(region));
}

#[test]
#[should_panic(expected = "is outside 0..=16")]
fn test_chunk_task_radius_is_bounded() {
    let server = TestServer::start();
    let _ = server.schedule_for_chunk(
        ChunkTaskSpec::new(ChunkPos::new(0, 0), 17, ChunkLevel::Border),
        0,
        |_| {},
        None,
    );
}

#[test]
fn test_distant_chunks_get_separate_regions() {
    let server = TestServer::start();
    let (_a, load_a) = load(&server, ChunkPos::new(0, 0));
    let (_b, load_b) = load(&server, ChunkPos::new(1000, 1000));

    assert_ne!(load_a.owner.id(), load_b.owner.id());
    assert_eq!(server.regions().len(), 2);
    assert!(wait_until(|| server.live_regions() == 2));
}

#[test]
fn test_bridging_chunk_forces_merge() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let b = ChunkPos::new(64, 0);
    let (_a, load_a) = load(&server, a);
    let (_b, load_b) = load(&server, b);
    assert_ne!(load_a.owner, load_b.owner);

    let bridge = ChunkPos::new(32, 0);
    let (_bridge, load_bridge) = load(&server, bridge);
    let survivor = load_bridge.owner;
    let absorbed = if survivor == load_a.owner {
        load_b.owner
    } else {
        load_a.owner
    };

    assert!(absorbed.is_dead());
    assert_eq!(server.regions(), vec![survivor.clone()]);
    for pos in [a, b, bridge] {
        assert_eq!(owner_id(&server, pos), Some(survivor.id()));
    }

    // Work sent to the absorbed region lands on the survivor.
    let (tx, rx) = channel::bounded(1);
    server
        .schedule_for_region(RegionHint::Region(absorbed), 0, move |ctx| {
            let _ = tx.send((ctx.id(), ctx.chunk_positions().count()));
        })
        .expect("forwarded");
    let (ran_on, chunks) = rx.recv_timeout(TIMEOUT).expect("task ran");
    assert_eq!(ran_on, survivor.id());
    assert_eq!(chunks, 3);
}

#[test]
fn test_nearby_regions_merge_after_streak() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let b = ChunkPos::new(48, 0);
    let (_a, load_a) = load(&server, a);
    let (_b, load_b) = load(&server, b);
    assert_ne!(load_a.owner, load_b.owner);

    assert!(wait_until(|| owner_id(&server, a) == owner_id(&server, b)));
    assert!(wait_until(|| server.live_regions() == 1));
    assert_eq!(server.regions().len(), 1);
}

#[test]
fn test_region_splits_when_bridge_unloads() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let c = ChunkPos::new(32, 0);
    let d = ChunkPos::new(64, 0);
    let b = ChunkPos::new(96, 0);
    let (_a, _) = load(&server, a);
    let (ticket_c, _) = load(&server, c);
    let (ticket_d, _) = load(&server, d);
    let (_b, _) = load(&server, b);
    assert!(wait_until(|| server.live_regions() == 1));
    let before = owner_id(&server, a).expect("a is owned");
    assert_eq!(owner_id(&server, b), Some(before));

    let pig = run_on(&server, b, move |ctx| ctx.spawn_entity("pig", middle_of(b)));

    assert!(server.chunks().remove_ticket(ticket_c));
    assert!(server.chunks().remove_ticket(ticket_d));
    assert!(wait_until(|| {
        matches!(
            (owner_id(&server, a), owner_id(&server, b)),
            (Some(x), Some(y)) if x != y
        )
    }));
    // One side keeps the old id.
    assert!([owner_id(&server, a), owner_id(&server, b)].contains(&Some(before)));
    assert!(wait_until(|| server.live_regions() == 2));

    // The entity went with its column.
    let owner_b = owner_id(&server, b).expect("b is owned");
    let (tx, rx) = channel::bounded(1);
    assert!(server.schedule_for_entity(
        &pig,
        0,
        move |mut entity| {
            let _ = tx.send(entity.context().id());
        },
        None,
    ));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("entity task ran"), owner_b);
}

#[test]
fn test_entity_task_follows_entity_across_regions() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let b = ChunkPos::new(1000, 0);
    let (_a, _) = load(&server, a);
    let (_b, load_b) = load(&server, b);

    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));
    let id = pig.id();
    let stayed = run_on(&server, a, move |ctx| ctx.move_entity(id, middle_of(b)));
    assert!(!stayed);

    let (tx, rx) = channel::bounded(1);
    assert!(server.schedule_for_entity(
        &pig,
        0,
        move |mut entity| {
            let chunk = entity.entity().map(Entity::chunk_pos);
            let _ = tx.send((entity.context().id(), chunk));
        },
        None,
    ));
    let (region, chunk) = rx.recv_timeout(TIMEOUT).expect("entity task ran");
    assert_eq!(region, load_b.owner.id());
    assert_eq!(chunk, Some(b));
    assert!(!pig.is_in_transit());
    assert_eq!(server.entity(&pig.uuid()), Some(pig));
}

#[test]
fn test_removed_entity_retires_pending_task() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let (_a, _) = load(&server, a);
    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));

    let ran = Arc::new(AtomicBool::new(false));
    let (retired_tx, retired_rx) = channel::bounded(1);
    let ran_flag = ran.clone();
    assert!(server.schedule_for_entity(
        &pig,
        20,
        move |_| ran_flag.store(true, Ordering::SeqCst),
        Some(Box::new(move || {
            let _ = retired_tx.send(());
        })),
    ));
    let id = pig.id();
    assert!(run_on(&server, a, move |ctx| ctx.remove_entity(id)));

    retired_rx.recv_timeout(TIMEOUT).expect("task retired");
    assert!(!ran.load(Ordering::SeqCst));
    assert!(pig.is_removed());
    assert!(server.entity(&pig.uuid()).is_none());
    assert!(!server.schedule_for_entity(&pig, 0, |_| {}, None));
}

#[test]
fn test_packets_round_trip_through_player() {
    let (sink_tx, sink_rx) = channel::unbounded();
    let server = TestServer::start_with(Services::default().with_packets(ChannelSink(sink_tx)));
    let a = ChunkPos::new(0, 0);
    let (_a, _) = load(&server, a);
    let uuid = Uuid::new_v4();
    let player = run_on(&server, a, move |ctx| {
        ctx.spawn_player(uuid, ConnectionId(7), middle_of(a))
    });
    assert_eq!(server.entity(&uuid).as_ref(), Some(&player));

    let inbound = InboundPacket {
        id: 3,
        payload: vec![1, 2],
    };
    assert!(server.deliver_packet(&player, inbound, |mut entity, packet| {
        entity.send_packet(OutboundPacket {
            id: packet.id + 100,
            payload: packet.payload,
        });
    }));

    let (connection, packets) = sink_rx.recv_timeout(TIMEOUT).expect("packets flushed");
    assert_eq!(connection, ConnectionId(7));
    assert_eq!(
        packets,
        vec![OutboundPacket {
            id: 103,
            payload: vec![1, 2]
        }]
    );
}

#[test]
fn test_unloaded_chunk_keeps_its_entities() {
    let storage = SharedStorage::default();
    let server = TestServer::start_with(shared_storage_services(&storage));
    let a = ChunkPos::new(3, 3);
    let (ticket, _) = load(&server, a);
    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));

    assert!(server.chunks().remove_ticket(ticket));
    assert!(wait_until(|| {
        server.chunks().state(a) == ChunkLoadState::Unloaded && storage.saved(a).is_some()
    }));
    assert!(pig.is_removed());
    assert_eq!(owner_id(&server, a), None);
    let saved = storage.saved(a).expect("saved");
    assert_eq!(saved.entities.len(), 1);
    assert_eq!(saved.entities[0].uuid, pig.uuid());

    let (_again, _) = load(&server, a);
    let kinds = run_on(&server, a, |ctx| {
        ctx.entities()
            .map(|entity| entity.kind().to_owned())
            .collect::<Vec<_>>()
    });
    assert_eq!(kinds, vec!["pig".to_owned()]);
    let reloaded = server.entity(&pig.uuid()).expect("back in the directory");
    assert_ne!(reloaded, pig);
}

#[test]
fn test_halt_saves_chunks_and_retires_tasks() {
    let storage = SharedStorage::default();
    let server = TestServer::start_with(shared_storage_services(&storage));
    let a = ChunkPos::new(0, 0);
    let (_a, _) = load(&server, a);
    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));

    let retired = Arc::new(AtomicUsize::new(0));
    let counter = retired.clone();
    server
        .schedule_for_chunk(
            ChunkTaskSpec::new(a, 0, ChunkLevel::Border),
            10_000,
            |_| panic!("must not run"),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .expect("task accepted");
    server.halt(true);
    assert!(server.is_halted());
    assert_eq!(server.live_regions(), 0);
    assert_eq!(retired.load(Ordering::SeqCst), 1);
    assert!(pig.is_removed());
    let saved = storage.saved(a).expect("saved on halt");
    assert_eq!(saved.entities.len(), 1);

    assert_eq!(
        server.schedule_global(0, |_| {}),
        Err(ScheduleError::SchedulerHalted)
    );
    assert!(server.is_halting());
}

#[test]
fn test_panicking_task_produces_crash_report() {
    let (tx, rx) = channel::unbounded();
    let policy = FatalPolicy::Custom(Arc::new(move |report: &CrashReport| {
        let _ = tx.send(report.clone());
    }));
    let server = TestServer::start_with(Services::default().with_fatal(policy));
    let a = ChunkPos::new(0, 0);
    let (_a, load_a) = load(&server, a);

    server
        .schedule_for_region(RegionHint::Chunk(a), 0, |_| panic!("boom"))
        .expect("task accepted");
    let report = rx.recv_timeout(TIMEOUT).expect("crash reported");
    assert_eq!(report.region, load_a.owner.id());
    assert_eq!(report.cause, CrashCause::Panic("boom".to_owned()));
    assert!(
        report
            .thread
            .as_deref()
            .is_some_and(|name| name.starts_with("Region Tick Thread"))
    );

    // The region keeps ticking.
    assert!(run_on(&server, a, move |ctx| ctx.owns_chunk(a)));
}

#[test]
fn test_repeating_region_task_keeps_its_period() {
    let server = TestServer::start();
    let a = ChunkPos::new(0, 0);
    let (_a, _) = load(&server, a);

    let (tx, rx) = channel::unbounded();
    let control = server
        .run_region_at_fixed_rate(RegionHint::Chunk(a), 0, 2, move |ctx| {
            let _ = tx.send(ctx.current_tick());
        })
        .expect("task accepted");
    let first = rx.recv_timeout(TIMEOUT).expect("first run");
    let second = rx.recv_timeout(TIMEOUT).expect("second run");
    assert_eq!(second - first, 2);

    control.cancel();
    thread::sleep(Duration::from_millis(50));
    while rx.try_recv().is_ok() {}
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_global_tasks_wait_their_delay() {
    let server = TestServer::start();
    let start = server.current_tick();
    let (tx, rx) = channel::bounded(1);
    server
        .schedule_global(3, move |ctx| {
            let _ = tx.send(ctx.tick());
        })
        .expect("task accepted");
    let ran_at = rx.recv_timeout(TIMEOUT).expect("global task ran");
    assert!(ran_at >= start + 3);

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let control = server
        .run_global_at_fixed_rate(0, 1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("task accepted");
    assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
    control.cancel();
    thread::sleep(Duration::from_millis(30));
    let after_cancel = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
}

#[test]
fn test_status_lists_regions() {
    let server = TestServer::start();
    let (_a, load_a) = load(&server, ChunkPos::new(0, 0));
    assert!(wait_until(|| {
        let status = server.status();
        status.loaded_chunks == 1 && status.region(load_a.owner.id()).is_some()
    }));
    let status = server.status();
    assert_eq!(status.regions.len(), 1);
    assert!(status.global_tick > 0);
    assert!(server.global_tick_report(TickTimes::SHORT_WINDOW).tick_count > 0);
}

#[test]
fn test_chunk_tasks_run_once_while_ownership_churns() {
    const TASKS: usize = 120;
    let server = TestServer::start();
    let anchors = [
        ChunkPos::new(0, 0),
        ChunkPos::new(96, 0),
        ChunkPos::new(0, 96),
        ChunkPos::new(96, 96),
    ];
    let bridges = [
        ChunkPos::new(32, 0),
        ChunkPos::new(64, 0),
        ChunkPos::new(0, 32),
        ChunkPos::new(0, 64),
    ];
    let _held: Vec<_> = anchors.iter().map(|pos| load(&server, *pos).0).collect();

    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
    let retired = Arc::new(AtomicUsize::new(0));

    // Bridges come and go, forcing merges and later splits while tasks are in flight.
    let churn = {
        let scheduler = server.0.clone();
        thread::spawn(move || {
            for _ in 0..4 {
                let tickets: Vec<_> = bridges
                    .iter()
                    .map(|pos| {
                        scheduler
                            .chunks()
                            .add_ticket(*pos, TicketType::Forced, ChunkLevel::Border)
                    })
                    .collect();
                thread::sleep(Duration::from_millis(60));
                for ticket in tickets {
                    scheduler.chunks().remove_ticket(ticket);
                }
                thread::sleep(Duration::from_millis(120));
            }
        })
    };

    for index in 0..TASKS {
        let anchor = anchors[index % anchors.len()];
        let runs = runs.clone();
        let retired = retired.clone();
        server
            .schedule_for_chunk(
                ChunkTaskSpec::new(anchor, 0, ChunkLevel::Border),
                (index % 7) as u64,
                move |ctx| {
                    assert!(ctx.owns_chunk(anchor));
                    runs[index].fetch_add(1, Ordering::SeqCst);
                },
                Some(Box::new(move || {
                    retired.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .expect("task accepted");
        if index % 10 == 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }
    churn.join().expect("churn thread");

    assert!(wait_until(|| {
        runs.iter().map(|count| count.load(Ordering::SeqCst)).sum::<usize>() == TASKS
    }));
    assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    assert_eq!(retired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_slow_region_does_not_stall_others() {
    let server = TestServer::start();
    let slow = ChunkPos::new(0, 0);
    let fast = ChunkPos::new(1000, 1000);
    let (_slow, _) = load(&server, slow);
    let (_fast, load_fast) = load(&server, fast);

    let (started_tx, started_rx) = channel::bounded(1);
    server
        .schedule_for_region(RegionHint::Chunk(slow), 0, move |_| {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(300));
        })
        .expect("task accepted");
    started_rx.recv_timeout(TIMEOUT).expect("slow task started");

    let before = load_fast.owner.current_tick();
    thread::sleep(Duration::from_millis(150));
    let after = load_fast.owner.current_tick();
    assert!(after >= before + 5, "fast region only advanced {before} -> {after}");
}

#[test]
fn test_column_stays_loaded_while_any_ticket_remains() {
    let server = TestServer::start();
    let pos = ChunkPos::new(5, 5);
    let (first, _) = load(&server, pos);
    let second = server
        .chunks()
        .add_ticket(pos, TicketType::Player, ChunkLevel::EntityTicking);

    assert!(server.chunks().remove_ticket(first));
    assert!(!server.chunks().remove_ticket(first));
    // Well past the unload delay.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(server.chunks().state(pos), ChunkLoadState::Loaded);
    assert!(owner_id(&server, pos).is_some());

    assert!(server.chunks().remove_ticket(second));
    assert!(wait_until(|| server.chunks().state(pos) == ChunkLoadState::Unloaded));
    assert_eq!(owner_id(&server, pos), None);
}

#[test]
fn test_transient_failure_is_retried() {
    let storage = FailingStorage::new(1, false);
    let config = SchedulerConfig {
        io_retries: 1,
        io_retry_backoff_ms: 1,
        ..test_config()
    };
    let services = Services::default().with_storage(ChunkStorage::External(storage.clone()));
    let server = TestServer::start_configured(config, services);
    let pos = ChunkPos::new(2, 2);

    let (_ticket, load) = load(&server, pos);
    assert_eq!(load.pos, pos);
    assert_eq!(storage.loads.load(Ordering::SeqCst), 2);
    assert_eq!(server.chunks().state(pos), ChunkLoadState::Loaded);
}

#[test]
fn test_exhausted_transient_failure_allows_later_load() {
    let storage = FailingStorage::new(2, false);
    let config = SchedulerConfig {
        io_retries: 1,
        io_retry_backoff_ms: 1,
        ..test_config()
    };
    let services = Services::default().with_storage(ChunkStorage::External(storage.clone()));
    let server = TestServer::start_configured(config, services);
    let pos = ChunkPos::new(5, 5);

    let first = block_on(server.chunks().load_future(pos));
    assert!(matches!(
        first,
        Err(ChunkLoadError::Io(ChunkIoError::Transient { .. }))
    ));
    assert_eq!(server.chunks().state(pos), ChunkLoadState::Unloaded);

    // Storage is back.
    let (_ticket, load) = load(&server, pos);
    assert_eq!(load.pos, pos);
    assert_eq!(storage.loads.load(Ordering::SeqCst), 3);
}

#[test]
fn test_corrupt_chunk_fails_permanently() {
    let storage = FailingStorage::new(1, true);
    let services = Services::default().with_storage(ChunkStorage::External(storage.clone()));
    let server = TestServer::start_with(services);
    let pos = ChunkPos::new(7, 7);

    let first = block_on(server.chunks().load_future(pos));
    assert!(matches!(
        first,
        Err(ChunkLoadError::Io(ChunkIoError::Corrupt { .. }))
    ));
    assert_eq!(server.chunks().state(pos), ChunkLoadState::Failed);

    let second = block_on(server.chunks().load_future(pos));
    assert!(matches!(second, Err(ChunkLoadError::PermanentlyFailed(p)) if p == pos));
    assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
    assert_eq!(owner_id(&server, pos), None);
}

#[test]
fn test_stuck_load_times_out() {
    let pos = ChunkPos::new(9, 9);
    let config = SchedulerConfig {
        load_timeout_ms: 50,
        ..test_config()
    };
    let services = Services::default().with_generator(SlowGenerator {
        slow: pos,
        delay: Duration::from_millis(300),
    });
    let server = TestServer::start_configured(config, services);

    let result = block_on(server.chunks().load_future(pos));
    assert!(matches!(result, Err(ChunkLoadError::TimedOut(p)) if p == pos));
    assert_eq!(server.chunks().state(pos), ChunkLoadState::Unloaded);
    assert_eq!(owner_id(&server, pos), None);
}

#[test]
fn test_halt_saves_entity_between_regions() {
    let storage = SharedStorage::default();
    let a = ChunkPos::new(0, 0);
    let far = ChunkPos::new(200, 0);
    let services = shared_storage_services(&storage).with_generator(SlowGenerator {
        slow: far,
        delay: Duration::from_millis(500),
    });
    let server = TestServer::start_with(services);
    let (_a, _) = load(&server, a);

    let cow = run_on(&server, a, move |ctx| ctx.spawn_entity("cow", middle_of(a)));
    let id = cow.id();
    assert!(!run_on(&server, a, move |ctx| ctx.move_entity(id, middle_of(far))));
    assert!(cow.is_in_transit());

    server.halt(true);

    let saved = storage.saved(far).expect("target column written on halt");
    let uuids: Vec<Uuid> = saved.entities.iter().map(|record| record.uuid).collect();
    assert_eq!(uuids, vec![cow.uuid()]);
    assert!(
        storage
            .saved(a)
            .is_some_and(|source| source.entities.is_empty())
    );
    assert!(cow.is_removed());
    assert_eq!(server.stranded_entities(), 0);
}

#[test]
fn test_entity_from_failed_hand_over_is_written_to_its_column() {
    let storage = SharedStorage::default();
    let a = ChunkPos::new(0, 0);
    let far = ChunkPos::new(200, 0);
    let config = SchedulerConfig {
        load_timeout_ms: 50,
        ..test_config()
    };
    let services = shared_storage_services(&storage).with_generator(SlowGenerator {
        slow: far,
        delay: Duration::from_millis(200),
    });
    let server = TestServer::start_configured(config, services);
    let (_a, _) = load(&server, a);

    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));
    let id = pig.id();
    assert!(!run_on(&server, a, move |ctx| ctx.move_entity(id, middle_of(far))));

    assert!(wait_until(|| {
        storage
            .saved(far)
            .is_some_and(|column| column.entities.iter().any(|e| e.uuid == pig.uuid()))
    }));
    assert!(pig.is_removed());
    assert!(server.entity(&pig.uuid()).is_none());
    assert_eq!(server.stranded_entities(), 0);
}

#[test]
fn test_entity_task_retires_after_max_attempts() {
    let a = ChunkPos::new(0, 0);
    let far = ChunkPos::new(200, 0);
    let config = SchedulerConfig {
        max_entity_task_attempts: Some(3),
        ..test_config()
    };
    let services = Services::default().with_generator(SlowGenerator {
        slow: far,
        delay: Duration::from_millis(1000),
    });
    let server = TestServer::start_configured(config, services);
    let (_a, _) = load(&server, a);

    let pig = run_on(&server, a, move |ctx| ctx.spawn_entity("pig", middle_of(a)));
    let id = pig.id();
    assert!(!run_on(&server, a, move |ctx| ctx.move_entity(id, middle_of(far))));

    let ran = Arc::new(AtomicBool::new(false));
    let ran_flag = ran.clone();
    let (retired_tx, retired_rx) = channel::bounded(1);
    assert!(server.schedule_for_entity(
        &pig,
        0,
        move |_| ran_flag.store(true, Ordering::SeqCst),
        Some(Box::new(move || {
            let _ = retired_tx.send(());
        })),
    ));
    retired_rx.recv_timeout(TIMEOUT).expect("task retired");
    assert!(!ran.load(Ordering::SeqCst));

    // The entity itself still arrives.
    assert!(wait_until(|| !pig.is_in_transit()));
    assert_eq!(server.stranded_entities(), 0);
}

#[test]
fn test_watchdog_reports_stuck_region() {
    let (tx, rx) = channel::unbounded();
    let policy = FatalPolicy::Custom(Arc::new(move |report: &CrashReport| {
        let _ = tx.send(report.clone());
    }));
    let config = SchedulerConfig {
        warn_after_ms: 20,
        crash_after_ms: 100,
        watchdog_interval_ms: 10,
        ..test_config()
    };
    let server = TestServer::start_configured(config, Services::default().with_fatal(policy));
    let a = ChunkPos::new(0, 0);
    let (_a, load_a) = load(&server, a);

    server
        .schedule_for_region(RegionHint::Chunk(a), 0, |_| {
            thread::sleep(Duration::from_millis(400));
        })
        .expect("task accepted");
    let report = rx.recv_timeout(TIMEOUT).expect("stuck tick reported");
    assert_eq!(report.region, load_a.owner.id());
    assert_eq!(report.cause, CrashCause::Stuck);
    assert!(report.elapsed.is_some_and(|elapsed| elapsed >= Duration::from_millis(100)));

    // Reported once per stuck tick; the region recovers afterwards.
    assert!(run_on(&server, a, move |ctx| ctx.owns_chunk(a)));
    assert!(rx.try_recv().is_err());
}
