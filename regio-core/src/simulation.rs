//! The hook through which game logic runs inside a region tick.

use crate::region::RegionContext;

/// Game simulation for one region tick.
///
/// Runs after the region's queued tasks, with exclusive access to the region's chunks and
/// entities through `ctx`. It must not block on other regions.
pub trait RegionSimulation: Send + Sync + 'static {
    /// Advances the region by one tick.
    fn tick(&self, ctx: &mut RegionContext);
}

/// Does nothing. The default when only scheduled tasks drive the world.
pub struct IdleSimulation;

impl RegionSimulation for IdleSimulation {
    fn tick(&self, _ctx: &mut RegionContext) {}
}
