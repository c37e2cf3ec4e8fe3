//! # Regio Core
//!
//! A regionized tick scheduler. The loaded world is split into independent regions that tick in
//! parallel on a pool of worker threads, merging when their chunks come close and splitting when
//! they drift apart. A single global tick thread handles the bookkeeping no region owns.
//!
//! Start one with [`RegionScheduler::start`] and submit work through it; never reach into a
//! region's data from outside its tick.

/// Chunk columns, tickets and the load pipeline.
pub mod chunk;
/// Chunk persistence backends.
pub mod chunk_saver;
/// Scheduler configuration.
pub mod config;
/// Entities and their thread-safe references.
pub mod entity;
/// Error types.
pub mod error;
/// Outbound packet batching.
pub mod network;
/// Regions and the per-tick context.
pub mod region;
/// Section bookkeeping for regions.
pub mod regionizer;
/// The scheduler itself.
pub mod scheduler;
/// The game logic hook.
pub mod simulation;
/// Tasks and task handles.
pub mod task;
/// Tick-keyed queues and tick timing.
pub mod ticks;
/// Thread ownership checks.
pub mod token;

pub use chunk::{ChunkLevel, TicketType};
pub use config::SchedulerConfig;
pub use entity::{EntityId, EntityPosition, EntityRef};
pub use error::{ChunkLoadError, ScheduleError, StartError};
pub use region::{EntityHandle, RegionContext, RegionHandle, RegionId, RegionState};
pub use scheduler::{
    ChunkTaskSpec, CrashCause, CrashReport, FatalPolicy, GlobalContext, RegionHint,
    RegionScheduler, ServerStatus, Services,
};
pub use task::ScheduledTask;
