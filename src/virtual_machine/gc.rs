//! Heap-object lifecycle.
//!
//! The engine talks to the collector only through [`GarbageCollector`]:
//! `allocate` hands out fresh non-zero ids, `increment`/`decrement` track
//! references held by stack slots and storage slots, and `is_alive` guards
//! field access. [`RefCountingGc`] frees an object the moment its count
//! reaches zero; [`NoOpGc`] never frees.

use stackvm_derive::Error;
use std::collections::HashMap;

/// Id reserved for the null reference.
pub const NULL_ID: u32 = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("null reference")]
    Null,
    /// Id was never allocated or has already been freed.
    #[error("invalid reference to object {id}")]
    InvalidReference { id: u32 },
}

/// Outcome of a decrement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Release {
    /// Object survives with the given remaining count.
    Alive(u32),
    /// Count reached zero; the caller must drop the object's storage.
    Dead,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GcStats {
    pub allocated: u64,
    pub collected: u64,
    pub live: u64,
    pub increments: u64,
    pub decrements: u64,
}

pub trait GarbageCollector: Send {
    /// Returns a fresh, non-zero, monotonically increasing id with count 0.
    fn allocate(&mut self) -> u32;

    /// Adds a reference; returns the new count.
    fn increment(&mut self, id: u32) -> Result<u32, GcError>;

    /// Drops a reference.
    fn decrement(&mut self, id: u32) -> Result<Release, GcError>;

    fn is_alive(&self, id: u32) -> bool;

    /// Current count, or `None` if the object is not alive.
    fn ref_count(&self, id: u32) -> Option<u32>;

    fn stats(&self) -> GcStats;

    /// Forgets every object and restarts ids at 1.
    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

/// Frees each object as soon as its count drops to zero.
#[derive(Debug)]
pub struct RefCountingGc {
    counts: HashMap<u32, u32>,
    next_id: u32,
    stats: GcStats,
}

impl Default for RefCountingGc {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            next_id: NULL_ID + 1,
            stats: GcStats::default(),
        }
    }
}

impl RefCountingGc {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GarbageCollector for RefCountingGc {
    fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.counts.insert(id, 0);
        self.stats.allocated += 1;
        self.stats.live += 1;
        id
    }

    fn increment(&mut self, id: u32) -> Result<u32, GcError> {
        if id == NULL_ID {
            return Err(GcError::Null);
        }
        let count = self
            .counts
            .get_mut(&id)
            .ok_or(GcError::InvalidReference { id })?;
        *count += 1;
        self.stats.increments += 1;
        Ok(*count)
    }

    fn decrement(&mut self, id: u32) -> Result<Release, GcError> {
        if id == NULL_ID {
            return Err(GcError::Null);
        }
        let count = self
            .counts
            .get_mut(&id)
            .ok_or(GcError::InvalidReference { id })?;
        if *count == 0 {
            return Err(GcError::InvalidReference { id });
        }
        *count -= 1;
        self.stats.decrements += 1;
        if *count > 0 {
            return Ok(Release::Alive(*count));
        }
        self.counts.remove(&id);
        self.stats.collected += 1;
        self.stats.live -= 1;
        Ok(Release::Dead)
    }

    fn is_alive(&self, id: u32) -> bool {
        self.counts.contains_key(&id)
    }

    fn ref_count(&self, id: u32) -> Option<u32> {
        self.counts.get(&id).copied()
    }

    fn stats(&self) -> GcStats {
        self.stats
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn name(&self) -> &'static str {
        "reference-counting"
    }
}

/// Allocates but never frees.
#[derive(Debug)]
pub struct NoOpGc {
    next_id: u32,
    stats: GcStats,
}

impl Default for NoOpGc {
    fn default() -> Self {
        Self {
            next_id: NULL_ID + 1,
            stats: GcStats::default(),
        }
    }
}

impl NoOpGc {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, id: u32) -> Result<(), GcError> {
        if id == NULL_ID {
            return Err(GcError::Null);
        }
        if !self.is_alive(id) {
            return Err(GcError::InvalidReference { id });
        }
        Ok(())
    }
}

impl GarbageCollector for NoOpGc {
    fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.allocated += 1;
        self.stats.live += 1;
        id
    }

    fn increment(&mut self, id: u32) -> Result<u32, GcError> {
        self.check(id)?;
        self.stats.increments += 1;
        Ok(1)
    }

    fn decrement(&mut self, id: u32) -> Result<Release, GcError> {
        self.check(id)?;
        self.stats.decrements += 1;
        Ok(Release::Alive(1))
    }

    fn is_alive(&self, id: u32) -> bool {
        id != NULL_ID && id < self.next_id
    }

    fn ref_count(&self, id: u32) -> Option<u32> {
        self.is_alive(id).then_some(1)
    }

    fn stats(&self) -> GcStats {
        self.stats
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
