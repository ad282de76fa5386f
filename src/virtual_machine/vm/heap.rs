use super::Value;
use crate::virtual_machine::errors::{Fault, FaultKind};
use std::collections::HashMap;

/// A heap object: fixed number of fields, optional type descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct StructValue {
    pub fields: Vec<Value>,
    pub type_tag: Option<String>,
}

impl StructValue {
    pub fn new(nfields: usize) -> Self {
        Self {
            fields: vec![Value::Int(0); nfields],
            type_tag: None,
        }
    }
}

/// Object table for struct values.
///
/// Slots are never compacted: a freed object leaves a `None` tombstone so
/// slot indices held elsewhere stay valid. Objects are found by id through
/// `index`, which loses its entry when the object dies.
#[derive(Debug, Default)]
pub(super) struct Heap {
    slots: Vec<Option<StructValue>>,
    index: HashMap<u32, usize>,
    /// Fields held by live objects.
    used_fields: usize,
    /// Capacity in fields.
    capacity: usize,
}

impl Heap {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Fails with `MemoryAccessOutOfBounds` unless `nfields` more fields fit.
    pub(super) fn reserve(&self, nfields: usize) -> Result<(), Fault> {
        if self.used_fields + nfields > self.capacity {
            return Err(Fault::new(
                FaultKind::MemoryAccessOutOfBounds,
                format!(
                    "heap exhausted: {} of {} fields in use, {} requested",
                    self.used_fields, self.capacity, nfields
                ),
            ));
        }
        Ok(())
    }

    /// Stores a new object under `id`.
    pub(super) fn insert(&mut self, id: u32, value: StructValue) -> Result<(), Fault> {
        self.reserve(value.fields.len())?;
        self.used_fields += value.fields.len();
        self.index.insert(id, self.slots.len());
        self.slots.push(Some(value));
        Ok(())
    }

    pub(super) fn get(&self, id: u32) -> Option<&StructValue> {
        let slot = *self.index.get(&id)?;
        self.slots.get(slot)?.as_ref()
    }

    pub(super) fn get_mut(&mut self, id: u32) -> Option<&mut StructValue> {
        let slot = *self.index.get(&id)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Tombstones the object's slot and returns its contents.
    pub(super) fn remove(&mut self, id: u32) -> Option<StructValue> {
        let slot = self.index.remove(&id)?;
        let value = self.slots.get_mut(slot)?.take()?;
        self.used_fields -= value.fields.len();
        Some(value)
    }

    /// Slot index of a live object.
    pub(super) fn slot_of(&self, id: u32) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub(super) fn live_count(&self) -> usize {
        self.index.len()
    }

    pub(super) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(super) fn used_fields(&self) -> usize {
        self.used_fields
    }

    /// Live objects ordered by id.
    pub(super) fn objects(&self) -> Vec<(u32, &StructValue)> {
        let mut out: Vec<(u32, &StructValue)> = self
            .index
            .iter()
            .filter_map(|(id, slot)| Some((*id, self.slots.get(*slot)?.as_ref()?)))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    pub(super) fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.used_fields = 0;
    }
}
