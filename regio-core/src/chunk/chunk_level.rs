use std::fmt;

use serde::Deserialize;

/// How far a column must be brought before it is usable.
///
/// Levels are ordered: a column at [`ChunkLevel::EntityTicking`] also satisfies every request
/// for [`ChunkLevel::BlockTicking`] and [`ChunkLevel::Border`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkLevel {
    /// Loaded and owned, but not simulated.
    Border,
    /// Block updates run.
    BlockTicking,
    /// Entities inside the column are simulated.
    EntityTicking,
}

impl ChunkLevel {
    /// Vanilla ticket levels at or below this threshold require a full chunk.
    pub const FULL_STATUS_LEVEL: u8 = 33;

    /// Converts a vanilla ticket level. Levels above the full status threshold are not loaded.
    #[must_use]
    pub const fn from_vanilla(level: u8) -> Option<Self> {
        match level {
            0..=31 => Some(Self::EntityTicking),
            32 => Some(Self::BlockTicking),
            Self::FULL_STATUS_LEVEL => Some(Self::Border),
            _ => None,
        }
    }

    /// The highest vanilla ticket level that still maps to this level.
    #[must_use]
    pub const fn to_vanilla(self) -> u8 {
        match self {
            Self::EntityTicking => 31,
            Self::BlockTicking => 32,
            Self::Border => Self::FULL_STATUS_LEVEL,
        }
    }
}

impl fmt::Display for ChunkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Border => "border",
            Self::BlockTicking => "block_ticking",
            Self::EntityTicking => "entity_ticking",
        })
    }
}

/// Why a column is being kept loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketType {
    /// Around a connected player.
    Player,
    /// Forced by an operator or plugin.
    Forced,
    /// The world spawn area.
    SpawnKeepAlive,
    /// A chunk-affine task waits for the column.
    PendingTask,
    /// Keeps a region alive while it has work that must run there.
    RegionHold,
    /// An explicit load request. Expires on its own.
    Request,
}

/// A reason to keep a column loaded, at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub(crate) id: u64,
    /// Why the ticket exists.
    pub ticket_type: TicketType,
    /// The level the column must reach.
    pub level: ChunkLevel,
    /// Global tick after which the ticket disappears, if it expires.
    pub expires_at: Option<u64>,
}
