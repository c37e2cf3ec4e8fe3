//! Error types shared across the scheduler.
//!
//! Contract violations (touching state from a thread that does not own it, halting and waiting
//! from a tick thread) are not errors; they panic.
use std::io;

use regio_utils::ChunkPos;
use thiserror::Error;

use crate::region::RegionId;

/// A failure reported by a chunk storage backend.
#[derive(Debug, Clone, Error)]
pub enum ChunkIoError {
    /// The backend may succeed if asked again.
    #[error("transient I/O failure for chunk {pos}: {message}")]
    Transient {
        /// The column being read or written.
        pos: ChunkPos,
        /// Backend description of the failure.
        message: String,
    },
    /// The stored column cannot be decoded. Retrying will not help.
    #[error("chunk {pos} is corrupt: {message}")]
    Corrupt {
        /// The column being read.
        pos: ChunkPos,
        /// Backend description of the failure.
        message: String,
    },
    /// The stored column uses a format this server cannot read.
    #[error("chunk {pos} uses an unsupported format: {message}")]
    Unsupported {
        /// The column being read.
        pos: ChunkPos,
        /// Backend description of the failure.
        message: String,
    },
}

impl ChunkIoError {
    /// Whether the operation is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Why a chunk load future resolved without a chunk.
#[derive(Debug, Clone, Error)]
pub enum ChunkLoadError {
    /// Storage or generation failed.
    #[error(transparent)]
    Io(#[from] ChunkIoError),
    /// An earlier load of this column failed permanently; it is not retried.
    #[error("chunk {0} previously failed to load")]
    PermanentlyFailed(ChunkPos),
    /// The load did not finish within the configured timeout.
    #[error("loading chunk {0} timed out")]
    TimedOut(ChunkPos),
    /// The scheduler is halting and no longer installs chunks.
    #[error("the scheduler is shutting down")]
    ShuttingDown,
    /// The load was dropped before it finished.
    #[error("the load was cancelled")]
    Cancelled,
}

/// A configuration that failed to load or validate.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// The configuration file could not be read or written.
    #[error("configuration file error: {0}")]
    Io(#[from] io::Error),
    /// The configuration file is not valid json5.
    #[error("configuration parse error: {0}")]
    Parse(String),
}

/// Work could not be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The scheduler has started halting.
    #[error("the scheduler is halting and accepts no new work")]
    SchedulerHalted,
    /// The target region was destroyed or halted and nothing absorbed it.
    #[error("region {0} no longer exists")]
    RegionDead(RegionId),
}

/// The scheduler could not be started.
#[derive(Debug, Error)]
pub enum StartError {
    /// The configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A thread or the I/O runtime could not be created.
    #[error("failed to spawn scheduler threads: {0}")]
    Spawn(#[from] io::Error),
}
