//! Lock type aliases so every crate agrees on which implementation backs which lock.

/// A blocking mutex. Does not poison, so a panicking tick never wedges its region data.
pub type SyncMutex<T> = parking_lot::Mutex<T>;
/// A blocking reader/writer lock.
pub type SyncRwLock<T> = parking_lot::RwLock<T>;
/// A condition variable paired with [`SyncMutex`].
pub type SyncCondvar = parking_lot::Condvar;
/// An async reader/writer lock, for state only touched from the I/O runtime.
pub type AsyncRwLock<T> = tokio::sync::RwLock<T>;
/// An owned guard of a [`SyncMutex`] held through an `Arc`, so it can outlive the borrow of the
/// mutex.
pub type SyncArcMutexGuard<T> = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, T>;
