//! Cross-region status snapshots.
//!
//! Nothing outside a region reads its data directly. The global tick thread periodically copies
//! the published counters of every region into a [`ServerStatus`], which any thread can load
//! without locking.

use std::time::{Duration, Instant};

use regio_utils::RegionSectionPos;

use crate::region::{RegionHandle, RegionId, RegionState, RegionStatsSnapshot};
use crate::regionizer::Topology;
use crate::ticks::{TickReport, TickTimes};

/// One region in a [`ServerStatus`].
#[derive(Debug, Clone)]
pub struct RegionStatus {
    /// The region.
    pub id: RegionId,
    /// Its lifecycle state when the snapshot was taken.
    pub state: RegionState,
    /// A section near its middle.
    pub center: Option<RegionSectionPos>,
    /// Sections owned, empty ones included.
    pub sections: usize,
    /// Published counters.
    pub stats: RegionStatsSnapshot,
    /// Timings over the last 15 seconds.
    pub report: TickReport,
}

/// A point-in-time view of the whole server.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    /// Global tick counter.
    pub global_tick: u64,
    /// When the snapshot was built.
    pub taken_at: Instant,
    /// Live regions, busiest first.
    pub regions: Vec<RegionStatus>,
    /// Columns registered in the topology.
    pub loaded_chunks: usize,
    /// Global tick timings over the last 15 seconds.
    pub global_report: TickReport,
}

impl ServerStatus {
    pub(crate) fn empty() -> Self {
        Self {
            global_tick: 0,
            taken_at: Instant::now(),
            regions: Vec::new(),
            loaded_chunks: 0,
            global_report: TickReport::default(),
        }
    }

    pub(crate) fn build(global_tick: u64, topology: &Topology, global_times: &TickTimes) -> Self {
        let now = Instant::now();
        let mut regions: Vec<RegionStatus> = topology
            .regions()
            .map(|region| region_status(region, topology))
            .collect();
        regions.sort_by(|a, b| {
            b.report
                .mspt_avg
                .total_cmp(&a.report.mspt_avg)
                .then(a.id.cmp(&b.id))
        });
        Self {
            global_tick,
            taken_at: now,
            regions,
            loaded_chunks: topology.map.loaded_count(),
            global_report: global_times.report(now, TickTimes::SHORT_WINDOW),
        }
    }

    /// Total entities over all regions.
    #[must_use]
    pub fn entities(&self) -> usize {
        self.regions.iter().map(|r| r.stats.entities).sum()
    }

    /// Total players over all regions.
    #[must_use]
    pub fn players(&self) -> usize {
        self.regions.iter().map(|r| r.stats.players).sum()
    }

    /// How old the snapshot is.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    /// The snapshot of one region.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&RegionStatus> {
        self.regions.iter().find(|r| r.id == id)
    }
}

fn region_status(region: &RegionHandle, topology: &Topology) -> RegionStatus {
    RegionStatus {
        id: region.id(),
        state: region.state(),
        center: topology.map.center_of(region.id()),
        sections: topology.map.section_count(region.id()),
        stats: region.stats(),
        report: region.tick_report(TickTimes::SHORT_WINDOW),
    }
}
