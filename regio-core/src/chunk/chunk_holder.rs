use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use regio_utils::ChunkPos;
use smallvec::SmallVec;
use tokio::sync::oneshot;

use super::{ChunkLevel, Ticket};
use crate::error::ChunkLoadError;
use crate::region::RegionHandle;

/// Where a column is in its load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkLoadState {
    /// Not resident and not being loaded.
    Unloaded,
    /// Being read, generated or handed to its region.
    Loading,
    /// Resident and owned by exactly one region.
    Loaded,
    /// Removed from its region and being written back.
    Saving,
    /// Loading failed permanently. Not retried.
    Failed,
}

/// A column that finished loading.
#[derive(Debug, Clone)]
pub struct ChunkLoad {
    /// The column.
    pub pos: ChunkPos,
    /// The region that owned it when the load completed. Ownership moves with merges and splits,
    /// so route work by position rather than by this handle when in doubt.
    pub owner: RegionHandle,
}

/// Resolves once a column is loaded and owned, or failed to load. Cheap to clone; every clone
/// observes the same outcome.
pub type ChunkLoadFuture = Shared<BoxFuture<'static, Result<ChunkLoad, ChunkLoadError>>>;

pub(crate) type LoadSender = oneshot::Sender<Result<ChunkLoad, ChunkLoadError>>;

pub(crate) struct PendingLoad {
    pub(crate) future: ChunkLoadFuture,
    // Taken by whoever runs the load.
    pub(crate) sender: Option<LoadSender>,
}

impl PendingLoad {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let future = receiver
            .map(|result| result.unwrap_or(Err(ChunkLoadError::Cancelled)))
            .boxed()
            .shared();
        Self {
            future,
            sender: Some(sender),
        }
    }
}

/// A snapshot of one column's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHolderInfo {
    /// The column.
    pub pos: ChunkPos,
    /// Its load state.
    pub state: ChunkLoadState,
    /// The highest level any ticket asks for.
    pub level: Option<ChunkLevel>,
    /// Live tickets.
    pub ticket_count: usize,
}

pub(crate) struct ChunkHolder {
    pos: ChunkPos,
    tickets: SmallVec<[Ticket; 4]>,
    level: Option<ChunkLevel>,
    pub(crate) state: ChunkLoadState,
    pub(crate) load: Option<PendingLoad>,
    /// Global tick the last ticket went away.
    pub(crate) ticketless_since: Option<u64>,
    pub(crate) unload_queued: bool,
}

impl ChunkHolder {
    pub(crate) fn new(pos: ChunkPos) -> Self {
        Self {
            pos,
            tickets: SmallVec::new(),
            level: None,
            state: ChunkLoadState::Unloaded,
            load: None,
            ticketless_since: None,
            unload_queued: false,
        }
    }

    pub(crate) const fn level(&self) -> Option<ChunkLevel> {
        self.level
    }

    pub(crate) fn add_ticket(&mut self, ticket: Ticket) {
        self.tickets.push(ticket);
        self.ticketless_since = None;
        self.recompute_level();
    }

    pub(crate) fn remove_ticket(&mut self, id: u64, now: u64) -> bool {
        let Some(index) = self.tickets.iter().position(|ticket| ticket.id == id) else {
            return false;
        };
        self.tickets.swap_remove(index);
        self.after_removal(now);
        true
    }

    pub(crate) fn expire_tickets(&mut self, now: u64) {
        let before = self.tickets.len();
        self.tickets
            .retain(|ticket| ticket.expires_at.is_none_or(|at| at > now));
        if self.tickets.len() != before {
            self.after_removal(now);
        }
    }

    fn after_removal(&mut self, now: u64) {
        self.recompute_level();
        if self.tickets.is_empty() {
            self.ticketless_since = Some(now);
        }
    }

    fn recompute_level(&mut self) {
        self.level = self.tickets.iter().map(|ticket| ticket.level).max();
    }

    pub(crate) fn info(&self) -> ChunkHolderInfo {
        ChunkHolderInfo {
            pos: self.pos,
            state: self.state,
            level: self.level,
            ticket_count: self.tickets.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::TicketType;

    fn ticket(id: u64, level: ChunkLevel, expires_at: Option<u64>) -> Ticket {
        Ticket {
            id,
            ticket_type: TicketType::Forced,
            level,
            expires_at,
        }
    }

    #[test]
    fn test_level_is_max_of_tickets() {
        let mut holder = ChunkHolder::new(ChunkPos::new(0, 0));
        assert_eq!(holder.level(), None);
        holder.add_ticket(ticket(1, ChunkLevel::Border, None));
        holder.add_ticket(ticket(2, ChunkLevel::EntityTicking, None));
        assert_eq!(holder.level(), Some(ChunkLevel::EntityTicking));

        assert!(holder.remove_ticket(2, 5));
        assert_eq!(holder.level(), Some(ChunkLevel::Border));
        assert_eq!(holder.ticketless_since, None);

        assert!(holder.remove_ticket(1, 7));
        assert!(!holder.remove_ticket(1, 7));
        assert_eq!(holder.level(), None);
        assert_eq!(holder.ticketless_since, Some(7));
    }

    #[test]
    fn test_request_tickets_expire() {
        let mut holder = ChunkHolder::new(ChunkPos::new(0, 0));
        holder.add_ticket(ticket(1, ChunkLevel::BlockTicking, Some(10)));
        holder.expire_tickets(9);
        assert_eq!(holder.level(), Some(ChunkLevel::BlockTicking));
        holder.expire_tickets(10);
        assert_eq!(holder.level(), None);
        assert_eq!(holder.ticketless_since, Some(10));
    }
}
