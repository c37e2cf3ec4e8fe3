use regio_utils::{ChunkPos, RegionSectionPos};
use rustc_hash::FxHashMap;

use super::RegionMap;
use crate::region::{RegionHandle, RegionId};

/// The section map together with the live region handles it refers to.
///
/// Written only by the global tick thread; everyone else takes the read lock to route work.
pub(crate) struct Topology {
    pub(crate) map: RegionMap,
    regions: FxHashMap<RegionId, RegionHandle>,
}

impl Topology {
    pub(crate) fn new(map: RegionMap) -> Self {
        Self {
            map,
            regions: FxHashMap::default(),
        }
    }

    pub(crate) fn owner(&self, chunk: ChunkPos) -> Option<&RegionHandle> {
        self.map
            .owner_of_chunk(chunk)
            .and_then(|id| self.regions.get(&id))
    }

    pub(crate) fn owner_of_section(&self, section: RegionSectionPos) -> Option<&RegionHandle> {
        self.map
            .owner_of_section(section)
            .and_then(|id| self.regions.get(&id))
    }

    pub(crate) fn region(&self, id: RegionId) -> Option<&RegionHandle> {
        self.regions.get(&id)
    }

    pub(crate) fn insert_region(&mut self, region: RegionHandle) {
        self.regions.insert(region.id(), region);
    }

    pub(crate) fn remove_region(&mut self, id: RegionId) -> Option<RegionHandle> {
        self.regions.remove(&id)
    }

    pub(crate) fn regions(&self) -> impl Iterator<Item = &RegionHandle> {
        self.regions.values()
    }
}
