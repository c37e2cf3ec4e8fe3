//! Thread ownership tracking.
//!
//! A region's data may only be touched from the thread currently ticking that region. The worker
//! records which region it is ticking in a thread local for the duration of the tick, and every
//! mutating accessor checks it. A mismatch is a programming error and panics with enough detail to
//! find the offending call site.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::thread;

use crate::region::{RegionHandle, RegionId};

/// What kind of scheduler thread the current thread is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Not a scheduler thread.
    External,
    /// A region tick worker.
    TickWorker,
    /// The global tick thread.
    Global,
    /// The shutdown coordinator.
    Shutdown,
}

thread_local! {
    static CURRENT_REGION: RefCell<Option<RegionHandle>> = const { RefCell::new(None) };
    static ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::External) };
}

/// Proof that the current thread is ticking a region. Clears itself on drop.
///
/// Not `Send`: the proof is only meaningful on the thread that acquired it.
pub struct OwnershipToken {
    region: RegionHandle,
    _not_send: PhantomData<*const ()>,
}

impl OwnershipToken {
    /// Marks the current thread as the owner of `region`.
    ///
    /// # Panics
    /// Panics if the thread already owns a region; ticks never nest.
    pub(crate) fn acquire(region: &RegionHandle) -> Self {
        CURRENT_REGION.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(held) = current.as_ref() {
                panic!(
                    "thread {:?} tried to take region {} while still holding region {}",
                    thread::current().name(),
                    region.id(),
                    held.id()
                );
            }
            *current = Some(region.clone());
        });
        Self {
            region: region.clone(),
            _not_send: PhantomData,
        }
    }

    /// The owned region.
    #[must_use]
    pub const fn region(&self) -> &RegionHandle {
        &self.region
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        CURRENT_REGION.with(|current| current.borrow_mut().take());
    }
}

/// The region the current thread is ticking, if any.
#[must_use]
pub fn current_region() -> Option<RegionHandle> {
    CURRENT_REGION.with(|current| current.borrow().clone())
}

/// The id of the region the current thread is ticking, if any.
#[must_use]
pub fn current_region_id() -> Option<RegionId> {
    CURRENT_REGION.with(|current| current.borrow().as_ref().map(|region| region.id()))
}

/// Panics unless the current thread is ticking `region`.
#[track_caller]
pub fn assert_owns(region: &RegionHandle) {
    let current = current_region_id();
    if current != Some(region.id()) {
        panic!(
            "thread {:?} accessed region {} without owning it (current region: {:?})",
            thread::current().name(),
            region.id(),
            current
        );
    }
}

/// The role of the current thread.
#[must_use]
pub fn thread_role() -> ThreadRole {
    ROLE.with(Cell::get)
}

/// Whether the current thread is the global tick thread.
#[must_use]
pub fn is_global_thread() -> bool {
    thread_role() == ThreadRole::Global
}

/// Whether the current thread runs scheduler ticks, global or regional.
#[must_use]
pub fn is_tick_thread() -> bool {
    matches!(thread_role(), ThreadRole::TickWorker | ThreadRole::Global)
}

pub(crate) fn set_thread_role(role: ThreadRole) {
    ROLE.with(|r| r.set(role));
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::region::RegionData;

    fn region() -> RegionHandle {
        RegionHandle::new(RegionId::next(), RegionData::new(0), Instant::now())
    }

    #[test]
    fn test_token_marks_current_region() {
        let region = region();
        assert!(current_region().is_none());
        {
            let token = OwnershipToken::acquire(&region);
            assert_eq!(token.region(), &region);
            assert_eq!(current_region_id(), Some(region.id()));
            assert_owns(&region);
        }
        assert!(current_region_id().is_none());
    }

    #[test]
    fn test_assert_owns_fails_on_other_thread() {
        let region = region();
        let _token = OwnershipToken::acquire(&region);
        let other = region.clone();
        let result = thread::spawn(move || assert_owns(&other)).join();
        assert!(result.is_err());
        assert_owns(&region);
    }

    #[test]
    #[should_panic(expected = "without owning it")]
    fn test_assert_owns_fails_for_other_region() {
        let owned = region();
        let _token = OwnershipToken::acquire(&owned);
        assert_owns(&region());
    }

    #[test]
    #[should_panic(expected = "while still holding region")]
    fn test_tokens_do_not_nest() {
        let first = region();
        let second = region();
        let _outer = OwnershipToken::acquire(&first);
        let _inner = OwnershipToken::acquire(&second);
    }

    #[test]
    fn test_roles_are_per_thread() {
        assert_eq!(thread_role(), ThreadRole::External);
        let role = thread::spawn(|| {
            set_thread_role(ThreadRole::Global);
            (is_global_thread(), is_tick_thread())
        })
        .join()
        .expect("thread");
        assert_eq!(role, (true, true));
        assert!(!is_tick_thread());
    }
}
