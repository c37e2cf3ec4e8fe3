//! The collaborators a scheduler is built from.

use std::process;
use std::sync::Arc;

use crate::chunk::{ChunkGenerator, FlatChunkGenerator};
use crate::chunk_saver::{ChunkStorage, RamOnlyStorage};
use crate::network::{DiscardPacketSink, PacketSink};
use crate::simulation::{IdleSimulation, RegionSimulation};

use super::CrashReport;

/// What to do after a crash report: a tick panicked, or a region or the global tick is stuck.
#[derive(Clone)]
pub enum FatalPolicy {
    /// Log the report and exit the process with `code`.
    ExitProcess {
        /// Process exit code.
        code: i32,
    },
    /// Log the report and halt the scheduler, saving what can be saved.
    HaltScheduler,
    /// Hand the report to a callback. The scheduler keeps running.
    Custom(Arc<dyn Fn(&CrashReport) + Send + Sync>),
}

impl FatalPolicy {
    pub(crate) fn exit_process(code: i32) -> ! {
        log::logger().flush();
        process::exit(code)
    }
}

impl Default for FatalPolicy {
    fn default() -> Self {
        Self::ExitProcess { code: 1 }
    }
}

/// Storage, generation, game logic and networking as seen by the scheduler.
#[derive(Clone)]
pub struct Services {
    /// Where columns are read from and written to.
    pub storage: Arc<ChunkStorage>,
    /// Produces columns storage does not have.
    pub generator: Arc<dyn ChunkGenerator>,
    /// Game logic run at the end of every region tick.
    pub simulation: Arc<dyn RegionSimulation>,
    /// Receives each region's outbound packets after its tick.
    pub packets: Arc<dyn PacketSink>,
    /// Reaction to crash reports.
    pub fatal: FatalPolicy,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            storage: Arc::new(RamOnlyStorage::empty_world().into()),
            generator: Arc::new(FlatChunkGenerator::default()),
            simulation: Arc::new(IdleSimulation),
            packets: Arc::new(DiscardPacketSink),
            fatal: FatalPolicy::default(),
        }
    }
}

impl Services {
    /// Replaces the storage backend.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<ChunkStorage>) -> Self {
        self.storage = Arc::new(storage.into());
        self
    }

    /// Replaces the generator.
    #[must_use]
    pub fn with_generator(mut self, generator: impl ChunkGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    /// Replaces the game logic hook.
    #[must_use]
    pub fn with_simulation(mut self, simulation: impl RegionSimulation) -> Self {
        self.simulation = Arc::new(simulation);
        self
    }

    /// Replaces the packet sink.
    #[must_use]
    pub fn with_packets(mut self, packets: impl PacketSink) -> Self {
        self.packets = Arc::new(packets);
        self
    }

    /// Replaces the crash policy.
    #[must_use]
    pub fn with_fatal(mut self, fatal: FatalPolicy) -> Self {
        self.fatal = fatal;
        self
    }
}
