// Wrapper types making it harder to accidentaly mix up chunk and section coordinates.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::math::Vector2;

/// A chunk column position. The vector's `y` holds the world z coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChunkPos(pub Vector2<i32>);

/// A region section position: a square of `2^shift` by `2^shift` chunk columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegionSectionPos(pub Vector2<i32>);

impl ChunkPos {
    /// Creates a chunk position from chunk coordinates.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self(Vector2::new(x, z))
    }

    /// The chunk containing the given block coordinates.
    #[must_use]
    pub const fn from_block(block_x: i32, block_z: i32) -> Self {
        Self::new(block_x >> 4, block_z >> 4)
    }

    /// The chunk x coordinate.
    #[must_use]
    pub const fn x(self) -> i32 {
        self.0.x
    }

    /// The chunk z coordinate.
    #[must_use]
    pub const fn z(self) -> i32 {
        self.0.y
    }

    /// Packs the position into a single `i64`, x in the low half.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        (self.0.x as i64 & 0xFFFF_FFFF) | ((self.0.y as i64) << 32)
    }

    /// Inverse of [`ChunkPos::as_i64`].
    #[must_use]
    pub const fn from_i64(packed: i64) -> Self {
        Self::new(packed as i32, (packed >> 32) as i32)
    }

    /// Chebyshev (square ring) distance in chunks.
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> i32 {
        (self.0.x - other.0.x)
            .abs()
            .max((self.0.y - other.0.y).abs())
    }

    /// The region section this chunk belongs to.
    #[must_use]
    pub const fn section(self, shift: u8) -> RegionSectionPos {
        RegionSectionPos::new(self.0.x >> shift, self.0.y >> shift)
    }

    /// Every chunk within `radius` of this one, including itself, in row order.
    pub fn square(self, radius: i32) -> impl Iterator<Item = Self> {
        (-radius..=radius).flat_map(move |dz| {
            (-radius..=radius).map(move |dx| Self::new(self.0.x + dx, self.0.y + dz))
        })
    }
}

impl Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.0.x, self.0.y)
    }
}

impl RegionSectionPos {
    /// Creates a section position from section coordinates.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self(Vector2::new(x, z))
    }

    /// The section x coordinate.
    #[must_use]
    pub const fn x(self) -> i32 {
        self.0.x
    }

    /// The section z coordinate.
    #[must_use]
    pub const fn z(self) -> i32 {
        self.0.y
    }

    /// Chebyshev distance in sections.
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> i32 {
        (self.0.x - other.0.x)
            .abs()
            .max((self.0.y - other.0.y).abs())
    }

    /// Every section within `radius` of this one, including itself.
    pub fn square(self, radius: i32) -> impl Iterator<Item = Self> {
        (-radius..=radius).flat_map(move |dz| {
            (-radius..=radius).map(move |dx| Self::new(self.0.x + dx, self.0.y + dz))
        })
    }

    /// The lowest chunk coordinate inside this section.
    #[must_use]
    pub const fn min_chunk(self, shift: u8) -> ChunkPos {
        ChunkPos::new(self.0.x << shift, self.0.y << shift)
    }
}

impl Display for RegionSectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "section[{}, {}]", self.0.x, self.0.y)
    }
}
