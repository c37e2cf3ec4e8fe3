//! Outbound packet batching.
//!
//! Region ticks never write to sockets. Packets produced during a tick are collected per
//! connection and handed to the [`PacketSink`] once, at the end of the tick.

use rustc_hash::FxHashMap;

use crate::region::RegionId;

/// Identifies a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// An encoded packet waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    /// Protocol packet id.
    pub id: i32,
    /// Encoded body.
    pub payload: Vec<u8>,
}

/// A decoded packet received from a connection, delivered to its player as an entity task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Protocol packet id.
    pub id: i32,
    /// Encoded body.
    pub payload: Vec<u8>,
}

/// The packets one tick produced, grouped by connection in send order.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    packets: FxHashMap<ConnectionId, Vec<OutboundPacket>>,
    count: usize,
}

impl OutboundBatch {
    /// Queues a packet for `connection`.
    pub fn push(&mut self, connection: ConnectionId, packet: OutboundPacket) {
        self.packets.entry(connection).or_default().push(packet);
        self.count += 1;
    }

    /// Total queued packets.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether nothing is queued.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Packets queued for one connection.
    #[must_use]
    pub fn for_connection(&self, connection: ConnectionId) -> &[OutboundPacket] {
        self.packets.get(&connection).map_or(&[], Vec::as_slice)
    }

    /// Consumes the batch, yielding each connection with its packets.
    pub fn into_connections(self) -> impl Iterator<Item = (ConnectionId, Vec<OutboundPacket>)> {
        self.packets.into_iter()
    }

    pub(crate) fn absorb(&mut self, other: Self) {
        for (connection, packets) in other.packets {
            self.count += packets.len();
            self.packets.entry(connection).or_default().extend(packets);
        }
    }
}

/// Receives the outbound batch at the end of each region tick.
///
/// Called on the region's tick thread; implementations should only hand the packets off to the
/// network layer.
pub trait PacketSink: Send + Sync + 'static {
    /// Takes ownership of one tick's packets.
    fn flush(&self, region: RegionId, batch: OutboundBatch);
}

/// Drops every packet. For worlds without a network layer.
pub struct DiscardPacketSink;

impl PacketSink for DiscardPacketSink {
    fn flush(&self, region: RegionId, batch: OutboundBatch) {
        log::trace!("Discarding {} packets from region {region}", batch.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_groups_by_connection() {
        let mut batch = OutboundBatch::default();
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        batch.push(a, OutboundPacket { id: 1, payload: vec![] });
        batch.push(b, OutboundPacket { id: 2, payload: vec![] });
        batch.push(a, OutboundPacket { id: 3, payload: vec![] });

        assert_eq!(batch.len(), 3);
        let ids: Vec<i32> = batch.for_connection(a).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(batch.for_connection(ConnectionId(3)).is_empty());
    }
}
