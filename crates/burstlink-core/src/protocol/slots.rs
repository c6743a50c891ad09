//! Schedule slot pool
//!
//! The device tracks a bounded number of pending timed commands. Each slot
//! remembers the target time of the command occupying it; a slot is free again
//! once that time is earlier than the time being scheduled. There is no
//! explicit release.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::{DispatchError, DEFAULT_SLOT_COUNT};

/// Fixed pool of schedule slots
#[derive(Debug, Clone)]
pub struct SlotScheduler {
    /// Target time held by each slot; `None` means never used
    slots: Vec<Option<Duration>>,
    /// Index handed out by the previous successful acquire
    last_assigned: Option<usize>,
}

impl SlotScheduler {
    /// Create a pool of `size` free slots
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            last_assigned: None,
        }
    }

    /// Number of slots in the pool
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index handed out by the previous acquire
    pub fn last_assigned(&self) -> Option<usize> {
        self.last_assigned
    }

    /// Target time currently held by `slot`
    pub fn target_time(&self, slot: usize) -> Option<Duration> {
        self.slots.get(slot).copied().flatten()
    }

    /// Whether `slot` may take a command due at `target_time`.
    ///
    /// The previously assigned slot is never eligible, even when expired.
    pub fn is_eligible(&self, slot: usize, target_time: Duration) -> bool {
        if self.last_assigned == Some(slot) {
            return false;
        }
        match self.slots.get(slot) {
            Some(Some(held)) => *held < target_time,
            Some(None) => true,
            None => false,
        }
    }

    /// Take the first eligible slot in index order and stamp it with `target_time`
    pub fn acquire(&mut self, target_time: Duration) -> Option<usize> {
        let index = (0..self.slots.len()).find(|&i| self.is_eligible(i, target_time))?;
        self.slots[index] = Some(target_time);
        self.last_assigned = Some(index);
        debug!(slot = index, target_us = target_time.as_micros() as u64, "slot acquired");
        Some(index)
    }

    /// Number of slots whose command is still pending at `now`
    pub fn pending_at(&self, now: Duration) -> usize {
        self.slots
            .iter()
            .filter(|held| matches!(held, Some(t) if *t >= now))
            .count()
    }
}

impl Default for SlotScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT)
    }
}

/// Shared handle to a [`SlotScheduler`].
///
/// The scan-then-stamp sequence in `acquire` runs under one lock, so callers
/// on different threads cannot be handed the same slot.
#[derive(Debug, Clone, Default)]
pub struct SlotPool {
    inner: Arc<Mutex<SlotScheduler>>,
}

impl SlotPool {
    /// Create a pool of `size` free slots
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotScheduler::new(size))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotScheduler> {
        // acquire has no fallible step between stamping a slot and recording it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire a slot, reporting exhaustion as a capacity error
    pub fn acquire(&self, target_time: Duration) -> Result<usize, DispatchError> {
        let mut scheduler = self.lock();
        scheduler
            .acquire(target_time)
            .ok_or(DispatchError::NoFreeSlot(scheduler.capacity()))
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Most recently assigned slot
    pub fn last_assigned(&self) -> Option<usize> {
        self.lock().last_assigned()
    }

    /// Target time currently held by `slot`
    pub fn target_time(&self, slot: usize) -> Option<Duration> {
        self.lock().target_time(slot)
    }

    /// Slots still holding a target time after `now`
    pub fn pending_at(&self, now: Duration) -> usize {
        self.lock().pending_at(now)
    }
}
