use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use quarry_error::{DbError, Result};

#[derive(Debug)]
struct TrackerState {
    /// Max bytes that can be reserved, None for unbounded.
    limit: Option<usize>,
    reserved: AtomicUsize,
}

/// Tracks memory reserved by long lived structures (hash tables, etc) against
/// a global budget.
///
/// Cheap to clone, clones share the same budget.
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    state: Arc<TrackerState>,
}

impl MemoryTracker {
    /// Create a tracker without a limit.
    pub fn unbounded() -> Self {
        MemoryTracker {
            state: Arc::new(TrackerState {
                limit: None,
                reserved: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_limit(limit_bytes: usize) -> Self {
        MemoryTracker {
            state: Arc::new(TrackerState {
                limit: Some(limit_bytes),
                reserved: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.state.limit
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> usize {
        self.state.reserved.load(Ordering::Relaxed)
    }

    /// Try to reserve some number of bytes.
    ///
    /// Reserving zero bytes never errors.
    pub fn try_reserve(&self, size_bytes: usize) -> Result<Reservation> {
        let reserved = &self.state.reserved;
        let mut current = reserved.load(Ordering::Relaxed);
        loop {
            let new = current.checked_add(size_bytes).ok_or_else(|| {
                DbError::new("Memory reservation overflow").with_field("size_bytes", size_bytes)
            })?;
            if let Some(limit) = self.state.limit {
                if new > limit && size_bytes > 0 {
                    return Err(DbError::new("Memory limit exceeded")
                        .with_field("requested_bytes", size_bytes)
                        .with_field("reserved_bytes", current)
                        .with_field("limit_bytes", limit));
                }
            }
            match reserved.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(Reservation {
            tracker: self.clone(),
            size: size_bytes,
        })
    }
}

/// Reserved bytes in a [`MemoryTracker`]. Released on drop.
#[derive(Debug)]
pub struct Reservation {
    tracker: MemoryTracker,
    size: usize,
}

impl Reservation {
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Combine another reservation from the same tracker into this one.
    pub fn merge(&mut self, mut other: Reservation) {
        debug_assert!(Arc::ptr_eq(&self.tracker.state, &other.tracker.state));
        self.size += other.size;
        other.size = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker
            .state
            .reserved
            .fetch_sub(self.size, Ordering::Relaxed);
    }
}
