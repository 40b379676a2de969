//! Unique identifiers for locks and semaphores

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Lock or ReentrantLock
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockId(u64);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

impl LockId {
    /// Generate a new unique LockId
    pub fn new() -> Self {
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock-{}", self.0)
    }
}

/// Unique identifier for a Semaphore
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SemaphoreId(u64);

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

impl SemaphoreId {
    /// Generate a new unique SemaphoreId
    pub fn new() -> Self {
        SemaphoreId(NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for SemaphoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "semaphore-{}", self.0)
    }
}
