//! The set of identifiers currently under orchestration.
//!
//! Membership is held by a [`RunningSlot`] guard: the identifier leaves the
//! set when the guard is dropped, whichever way the owning task exits.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRefusal {
    /// The set already holds `capacity` identifiers.
    Full,
    /// The identifier is already in the set.
    AlreadyRunning,
}

#[derive(Debug)]
struct Inner {
    members: Mutex<HashSet<String>>,
    capacity: usize,
}

/// Bounded set of running identifiers. Cloning shares the set.
#[derive(Debug, Clone)]
pub struct RunningJobSet {
    inner: Arc<Inner>,
}

impl RunningJobSet {
    /// Create a set holding at most `capacity` identifiers.
    ///
    /// A capacity of zero means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                members: Mutex::new(HashSet::new()),
                capacity,
            }),
        }
    }

    /// Claim a slot for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotRefusal::Full`] at capacity and
    /// [`SlotRefusal::AlreadyRunning`] if `key` already holds a slot.
    pub fn try_acquire(&self, key: &str) -> std::result::Result<RunningSlot, SlotRefusal> {
        let mut members = self.inner.members.lock();
        if members.contains(key) {
            return Err(SlotRefusal::AlreadyRunning);
        }
        if self.inner.capacity > 0 && members.len() >= self.inner.capacity {
            return Err(SlotRefusal::Full);
        }
        members.insert(key.to_string());
        debug!("Running slot acquired for {} ({} in use)", key, members.len());
        Ok(RunningSlot {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
        })
    }

    /// Whether `key` currently holds a slot.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.members.lock().contains(key)
    }

    /// Slots in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    /// Whether no slot is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity (zero is unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Membership of one identifier in a [`RunningJobSet`].
#[derive(Debug)]
pub struct RunningSlot {
    inner: Arc<Inner>,
    key: String,
}

impl RunningSlot {
    /// Identifier currently holding the slot.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Move the slot to a new identifier without releasing capacity.
    ///
    /// # Errors
    ///
    /// Returns [`SlotRefusal::AlreadyRunning`] if `new_key` holds another
    /// slot; this slot keeps its current identifier.
    pub fn rekey(&mut self, new_key: &str) -> std::result::Result<(), SlotRefusal> {
        if new_key == self.key {
            return Ok(());
        }
        let mut members = self.inner.members.lock();
        if members.contains(new_key) {
            return Err(SlotRefusal::AlreadyRunning);
        }
        members.remove(&self.key);
        members.insert(new_key.to_string());
        debug!("Running slot {} rekeyed to {}", self.key, new_key);
        self.key = new_key.to_string();
        Ok(())
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        let mut members = self.inner.members.lock();
        if members.remove(&self.key) {
            debug!("Running slot released for {}", self.key);
        } else {
            warn!("Running slot for {} was already gone", self.key);
        }
    }
}
