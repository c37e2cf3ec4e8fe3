//! A packet sink for running without a network layer.

use regio_core::network::{OutboundBatch, PacketSink};
use regio_core::RegionId;

/// Logs every flushed batch at trace level and drops it.
pub struct LoggingPacketSink;

impl PacketSink for LoggingPacketSink {
    fn flush(&self, region: RegionId, batch: OutboundBatch) {
        for (connection, packets) in batch.into_connections() {
            log::trace!(
                "Region {region} flushed {} packets to connection {}",
                packets.len(),
                connection.0
            );
        }
    }
}
