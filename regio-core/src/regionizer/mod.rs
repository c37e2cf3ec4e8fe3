//! Section topology.
//!
//! The world is cut into square sections of `2^shift` chunk columns. Every section that holds a
//! loaded column belongs to a region, and so does every section within `buffer` sections of it.
//! Because of that buffer, two regions never own columns closer than `buffer` sections apart, which
//! is what lets them tick in parallel without touching each other's state.
//!
//! [`RegionMap`] only does the bookkeeping. It never owns region data; the scheduler consults it
//! to decide where a column goes and which regions must merge or may split, then moves the data.

mod topology;

pub(crate) use topology::Topology;

use std::cmp::Reverse;
use std::collections::VecDeque;

use regio_utils::{ChunkPos, RegionSectionPos};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::config::SchedulerConfig;
use crate::region::RegionId;

#[derive(Debug, Clone, Copy)]
struct SectionEntry {
    region: RegionId,
    chunks: u32,
}

/// Which region owns which section, and which columns are loaded.
#[derive(Debug)]
pub struct RegionMap {
    shift: u8,
    buffer: i32,
    sections: FxHashMap<RegionSectionPos, SectionEntry>,
    regions: FxHashMap<RegionId, FxHashSet<RegionSectionPos>>,
    loaded: FxHashSet<ChunkPos>,
    emptied: FxHashSet<RegionSectionPos>,
}

impl RegionMap {
    /// Creates an empty map.
    ///
    /// # Panics
    /// Panics if `buffer` is not positive.
    #[must_use]
    pub fn new(shift: u8, buffer: i32) -> Self {
        assert!(buffer > 0, "the section buffer must be at least one section");
        Self {
            shift,
            buffer,
            sections: FxHashMap::default(),
            regions: FxHashMap::default(),
            loaded: FxHashSet::default(),
            emptied: FxHashSet::default(),
        }
    }

    /// Creates an empty map using the configured section size and buffer.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.section_shift, config.buffer_radius)
    }

    /// The section containing `chunk`.
    #[must_use]
    pub const fn section_of(&self, chunk: ChunkPos) -> RegionSectionPos {
        chunk.section(self.shift)
    }

    /// The region owning a loaded column.
    #[must_use]
    pub fn owner_of_chunk(&self, chunk: ChunkPos) -> Option<RegionId> {
        if !self.loaded.contains(&chunk) {
            return None;
        }
        self.owner_of_section(self.section_of(chunk))
    }

    /// The region owning a section, whether or not it holds columns.
    #[must_use]
    pub fn owner_of_section(&self, section: RegionSectionPos) -> Option<RegionId> {
        self.sections.get(&section).map(|entry| entry.region)
    }

    /// Whether a column is registered as loaded.
    #[must_use]
    pub fn is_loaded(&self, chunk: ChunkPos) -> bool {
        self.loaded.contains(&chunk)
    }

    /// Total loaded columns.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Every region that owns a section the column at `chunk` would claim.
    ///
    /// Adding the column is only legal once this yields at most one region.
    #[must_use]
    pub fn regions_near(&self, chunk: ChunkPos) -> SmallVec<[RegionId; 4]> {
        let mut found = SmallVec::new();
        for section in self.section_of(chunk).square(self.buffer) {
            if let Some(entry) = self.sections.get(&section)
                && !found.contains(&entry.region)
            {
                found.push(entry.region);
            }
        }
        found
    }

    /// Registers a loaded column in `region`, claiming its section and the buffer around it.
    ///
    /// # Panics
    /// Panics if another region already owns one of the claimed sections.
    pub fn add_chunk(&mut self, chunk: ChunkPos, region: RegionId) {
        if !self.loaded.insert(chunk) {
            return;
        }
        let center = self.section_of(chunk);
        let owned = self.regions.entry(region).or_default();
        for section in center.square(self.buffer) {
            let entry = self.sections.entry(section).or_insert(SectionEntry { region, chunks: 0 });
            assert_eq!(
                entry.region, region,
                "{section} belongs to region {} while adding {chunk} to region {region}",
                entry.region
            );
            owned.insert(section);
        }
        if let Some(entry) = self.sections.get_mut(&center) {
            entry.chunks += 1;
        }
        self.emptied.remove(&center);
    }

    /// Unregisters a column. Returns the region that owned it.
    ///
    /// Sections left empty are reclaimed by the next [`RegionMap::collect_garbage`].
    pub fn remove_chunk(&mut self, chunk: ChunkPos) -> Option<RegionId> {
        if !self.loaded.remove(&chunk) {
            return None;
        }
        let center = self.section_of(chunk);
        let entry = self.sections.get_mut(&center)?;
        entry.chunks -= 1;
        if entry.chunks == 0 {
            self.emptied.insert(center);
        }
        Some(entry.region)
    }

    /// Drops empty sections no longer needed as anyone's buffer.
    ///
    /// Returns the regions left without any section; they hold no columns and can be destroyed.
    pub fn collect_garbage(&mut self) -> Vec<RegionId> {
        let mut touched_regions: FxHashSet<RegionId> = FxHashSet::default();
        let emptied: Vec<_> = self.emptied.drain().collect();
        for center in emptied {
            for section in center.square(self.buffer) {
                let Some(entry) = self.sections.get(&section).copied() else {
                    continue;
                };
                if entry.chunks > 0 || self.has_non_empty_neighbour(section, entry.region) {
                    continue;
                }
                self.sections.remove(&section);
                if let Some(owned) = self.regions.get_mut(&entry.region) {
                    owned.remove(&section);
                }
                touched_regions.insert(entry.region);
            }
        }

        let mut dead = Vec::new();
        for region in touched_regions {
            if self.regions.get(&region).is_some_and(FxHashSet::is_empty) {
                self.regions.remove(&region);
                dead.push(region);
            }
        }
        dead
    }

    fn has_non_empty_neighbour(&self, section: RegionSectionPos, region: RegionId) -> bool {
        section.square(self.buffer).any(|other| {
            self.sections
                .get(&other)
                .is_some_and(|entry| entry.region == region && entry.chunks > 0)
        })
    }

    /// Reassigns every section of `from` to `into`. `from` ceases to exist.
    pub fn merge(&mut self, from: RegionId, into: RegionId) {
        let Some(moved) = self.regions.remove(&from) else {
            return;
        };
        for section in &moved {
            if let Some(entry) = self.sections.get_mut(section) {
                entry.region = into;
            }
        }
        self.regions.entry(into).or_default().extend(moved);
    }

    /// Live region ids.
    pub fn region_ids(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.keys().copied()
    }

    /// Whether the map knows `region`.
    #[must_use]
    pub fn contains_region(&self, region: RegionId) -> bool {
        self.regions.contains_key(&region)
    }

    /// Number of sections, empty or not, owned by `region`.
    #[must_use]
    pub fn section_count(&self, region: RegionId) -> usize {
        self.regions.get(&region).map_or(0, FxHashSet::len)
    }

    /// Sections holding at least one column, owned by `region`.
    #[must_use]
    pub fn non_empty_sections(&self, region: RegionId) -> Vec<RegionSectionPos> {
        self.regions.get(&region).map_or_else(Vec::new, |owned| {
            owned
                .iter()
                .copied()
                .filter(|section| self.sections.get(section).is_some_and(|e| e.chunks > 0))
                .collect()
        })
    }

    /// Loaded columns owned by `region`.
    #[must_use]
    pub fn chunk_count(&self, region: RegionId) -> usize {
        self.regions.get(&region).map_or(0, |owned| {
            owned
                .iter()
                .filter_map(|section| self.sections.get(section))
                .map(|entry| entry.chunks as usize)
                .sum()
        })
    }

    /// The non-empty section closest to the middle of `region`, used as a display position.
    #[must_use]
    pub fn center_of(&self, region: RegionId) -> Option<RegionSectionPos> {
        let sections = self.non_empty_sections(region);
        if sections.is_empty() {
            return None;
        }
        let n = sections.len() as i64;
        let x = sections.iter().map(|s| i64::from(s.x())).sum::<i64>() / n;
        let z = sections.iter().map(|s| i64::from(s.z())).sum::<i64>() / n;
        let mean = RegionSectionPos::new(x as i32, z as i32);
        sections
            .into_iter()
            .min_by_key(|section| section.chebyshev_distance(mean))
    }

    /// Pairs of distinct regions with non-empty sections within `radius` sections of each other.
    /// Each pair is reported once, lower id first.
    #[must_use]
    pub fn merge_candidates(&self, radius: i32) -> Vec<(RegionId, RegionId)> {
        let mut pairs: FxHashSet<(RegionId, RegionId)> = FxHashSet::default();
        for (section, entry) in &self.sections {
            if entry.chunks == 0 {
                continue;
            }
            for other in section.square(radius) {
                if let Some(near) = self.sections.get(&other)
                    && near.chunks > 0
                    && near.region != entry.region
                {
                    let pair = if entry.region < near.region {
                        (entry.region, near.region)
                    } else {
                        (near.region, entry.region)
                    };
                    pairs.insert(pair);
                }
            }
        }
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_unstable();
        pairs
    }

    /// Groups the sections of `region` into independent parts.
    ///
    /// Non-empty sections within `split_distance` of each other end up in the same part; every
    /// empty section goes with the part it buffers. Parts are ordered largest first. A result with
    /// fewer than two parts means the region is connected.
    #[must_use]
    pub fn split_plan(&self, region: RegionId, split_distance: i32) -> Vec<Vec<RegionSectionPos>> {
        let Some(owned) = self.regions.get(&region) else {
            return Vec::new();
        };

        let mut remaining: FxHashSet<RegionSectionPos> =
            self.non_empty_sections(region).into_iter().collect();
        let mut parts: Vec<Vec<RegionSectionPos>> = Vec::new();
        while let Some(&start) = remaining.iter().next() {
            remaining.remove(&start);
            let mut part = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(section) = queue.pop_front() {
                for other in section.square(split_distance) {
                    if remaining.remove(&other) {
                        part.push(other);
                        queue.push_back(other);
                    }
                }
            }
            parts.push(part);
        }
        if parts.len() < 2 {
            return vec![owned.iter().copied().collect()];
        }
        parts.sort_by_key(|part| Reverse(part.len()));

        let mut part_of: FxHashMap<RegionSectionPos, usize> = FxHashMap::default();
        for (index, part) in parts.iter().enumerate() {
            for section in part {
                part_of.insert(*section, index);
            }
        }
        for section in owned {
            if part_of.contains_key(section) {
                continue;
            }
            let index = section
                .square(self.buffer)
                .find_map(|near| part_of.get(&near).copied())
                .unwrap_or(0);
            parts[index].push(*section);
        }
        parts
    }

    /// Applies a plan from [`RegionMap::split_plan`]. The first part stays with `region`; part
    /// `i + 1` goes to `new_ids[i]`.
    ///
    /// # Panics
    /// Panics if there are not enough new ids for the parts.
    pub fn apply_split(
        &mut self,
        region: RegionId,
        parts: &[Vec<RegionSectionPos>],
        new_ids: &[RegionId],
    ) {
        assert!(
            new_ids.len() + 1 >= parts.len(),
            "split of region {region} into {} parts got {} new ids",
            parts.len(),
            new_ids.len()
        );
        for (part, &id) in parts.iter().skip(1).zip(new_ids) {
            let mut owned = FxHashSet::default();
            for section in part {
                if let Some(entry) = self.sections.get_mut(section) {
                    entry.region = id;
                }
                if let Some(old) = self.regions.get_mut(&region) {
                    old.remove(section);
                }
                owned.insert(*section);
            }
            self.regions.insert(id, owned);
        }
    }

    /// Checks the buffer invariant. Used by tests and debug assertions.
    pub fn verify(&self) -> Result<(), String> {
        for chunk in &self.loaded {
            let section = self.section_of(*chunk);
            match self.sections.get(&section) {
                Some(entry) if entry.chunks > 0 => {}
                _ => return Err(format!("{chunk} is loaded but {section} is not marked non-empty")),
            }
        }
        for (section, entry) in &self.sections {
            if !self
                .regions
                .get(&entry.region)
                .is_some_and(|owned| owned.contains(section))
            {
                return Err(format!("{section} is not listed under region {}", entry.region));
            }
            if entry.chunks == 0 {
                continue;
            }
            for near in section.square(self.buffer) {
                match self.sections.get(&near) {
                    Some(other) if other.region == entry.region => {}
                    Some(other) => {
                        return Err(format!(
                            "{near} buffers {section} of region {} but belongs to region {}",
                            entry.region, other.region
                        ));
                    }
                    None => return Err(format!("{near} buffers {section} but is unowned")),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: RegionId = RegionId(1);
    const B: RegionId = RegionId(2);
    const C: RegionId = RegionId(3);

    fn map() -> RegionMap {
        RegionMap::new(4, 1)
    }

    #[test]
    fn test_add_claims_buffer() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        assert_eq!(map.section_count(A), 9);
        assert_eq!(map.owner_of_chunk(ChunkPos::new(0, 0)), Some(A));
        assert_eq!(map.owner_of_chunk(ChunkPos::new(1, 0)), None);
        assert_eq!(map.owner_of_section(RegionSectionPos::new(-1, 1)), Some(A));
        map.verify().expect("buffer invariant");
    }

    #[test]
    fn test_regions_near_detects_conflict() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        // Section 3 is two sections away from A's buffer edge: free.
        assert!(map.regions_near(ChunkPos::new(48, 0)).is_empty());
        // Section 2 touches A's buffer at section 1.
        assert_eq!(map.regions_near(ChunkPos::new(32, 0)).as_slice(), &[A]);
    }

    #[test]
    fn test_forced_merge_then_add() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(64, 0), B);
        let bridge = ChunkPos::new(32, 0);
        let near = map.regions_near(bridge);
        assert_eq!(near.len(), 2);

        map.merge(B, A);
        map.add_chunk(bridge, A);
        assert!(!map.contains_region(B));
        assert_eq!(map.owner_of_chunk(ChunkPos::new(64, 0)), Some(A));
        assert_eq!(map.chunk_count(A), 3);
        map.verify().expect("buffer invariant");
    }

    #[test]
    #[should_panic(expected = "belongs to region")]
    fn test_add_into_foreign_buffer_panics() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(32, 0), B);
    }

    #[test]
    fn test_garbage_collection_releases_buffer() {
        let mut map = map();
        let chunk = ChunkPos::new(5, 5);
        map.add_chunk(chunk, A);
        assert_eq!(map.remove_chunk(chunk), Some(A));
        // Nothing is reclaimed until collection runs.
        assert_eq!(map.section_count(A), 9);

        let dead = map.collect_garbage();
        assert_eq!(dead, vec![A]);
        assert!(!map.contains_region(A));
        assert!(map.regions_near(chunk).is_empty());
        map.verify().expect("buffer invariant");
    }

    #[test]
    fn test_garbage_collection_keeps_needed_buffer() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(16, 0), A);
        map.remove_chunk(ChunkPos::new(16, 0));
        assert!(map.collect_garbage().is_empty());
        // Section 1 still buffers section 0; section 2 does not buffer anything.
        assert_eq!(map.owner_of_section(RegionSectionPos::new(1, 0)), Some(A));
        assert_eq!(map.owner_of_section(RegionSectionPos::new(2, 0)), None);
        map.verify().expect("buffer invariant");
    }

    #[test]
    fn test_merge_candidates_within_radius() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(48, 0), B);
        map.add_chunk(ChunkPos::new(400, 400), C);
        assert_eq!(map.merge_candidates(3), vec![(A, B)]);
        assert!(map.merge_candidates(2).is_empty());
    }

    #[test]
    fn test_split_plan_and_apply() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(16, 0), A);
        map.add_chunk(ChunkPos::new(48, 0), A);
        map.add_chunk(ChunkPos::new(160, 0), A);

        // Sections 0, 1 and 3 link within distance 2; section 10 stands alone.
        let plan = map.split_plan(A, 2);
        assert_eq!(plan.len(), 2);
        assert!(plan[0].contains(&RegionSectionPos::new(3, 0)));
        assert!(plan[1].contains(&RegionSectionPos::new(10, 0)));
        assert!(plan[1].contains(&RegionSectionPos::new(11, 1)));

        map.apply_split(A, &plan, &[B]);
        assert_eq!(map.owner_of_chunk(ChunkPos::new(48, 0)), Some(A));
        assert_eq!(map.owner_of_chunk(ChunkPos::new(160, 0)), Some(B));
        assert_eq!(map.chunk_count(A), 3);
        assert_eq!(map.chunk_count(B), 1);
        map.verify().expect("buffer invariant");
    }

    #[test]
    fn test_connected_region_does_not_split() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(32, 0), A);
        assert_eq!(map.split_plan(A, 2).len(), 1);
    }

    #[test]
    fn test_split_after_merge_restores_partition() {
        let mut map = map();
        map.add_chunk(ChunkPos::new(0, 0), A);
        map.add_chunk(ChunkPos::new(200, 200), B);
        let a_sections = map.section_count(A);
        let b_sections = map.section_count(B);

        map.merge(B, A);
        let plan = map.split_plan(A, 4);
        assert_eq!(plan.len(), 2);
        map.apply_split(A, &plan, &[C]);

        let mut sizes = vec![map.section_count(A), map.section_count(C)];
        sizes.sort_unstable();
        let mut expected = vec![a_sections, b_sections];
        expected.sort_unstable();
        assert_eq!(sizes, expected);
        assert_ne!(
            map.owner_of_chunk(ChunkPos::new(0, 0)),
            map.owner_of_chunk(ChunkPos::new(200, 200))
        );
        map.verify().expect("buffer invariant");
    }
}
