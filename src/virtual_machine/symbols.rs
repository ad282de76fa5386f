//! Symbols and the constant pool.
//!
//! The constant pool is append-only and de-duplicated: string literals,
//! float literals and function symbols each get one slot, and bytecode
//! refers to them by index. A function referenced before its definition
//! occupies a placeholder slot that the definition later fills in place,
//! so previously emitted `call` operands stay valid.

use stackvm_derive::BinaryCodec;
use std::collections::HashMap;

/// A function entry point.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct FunctionSymbol {
    pub name: String,
    pub nargs: u16,
    pub nlocals: u16,
    /// Word index of the first instruction, `None` until defined.
    pub address: Option<u32>,
}

impl FunctionSymbol {
    /// Placeholder for a function referenced before its definition.
    pub fn forward(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nargs: 0,
            nlocals: 0,
            address: None,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.address.is_some()
    }

    /// Locals slots of a frame: arguments first, then declared locals.
    pub fn frame_slots(&self) -> usize {
        self.nargs as usize + self.nlocals as usize
    }
}

/// A code label, possibly referenced before it is defined.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSymbol {
    pub name: String,
    pub address: Option<u32>,
    /// Word indices of operands waiting for this label's address.
    pub forward_refs: Vec<usize>,
}

impl LabelSymbol {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_defined(&self) -> bool {
        self.address.is_some()
    }

    pub fn is_forward_ref(&self) -> bool {
        !self.forward_refs.is_empty()
    }
}

/// One constant-pool slot.
#[derive(Clone, Debug, PartialEq, BinaryCodec)]
pub enum PoolEntry {
    Str(String),
    Float(f32),
    Function(FunctionSymbol),
}

/// Identity used for de-duplication: floats by bit pattern, functions by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PoolKey {
    Str(String),
    Float(u32),
    Function(String),
}

impl PoolEntry {
    fn key(&self) -> PoolKey {
        match self {
            PoolEntry::Str(s) => PoolKey::Str(s.clone()),
            PoolEntry::Float(v) => PoolKey::Float(v.to_bits()),
            PoolEntry::Function(f) => PoolKey::Function(f.name.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PoolEntry::Str(_) => "string",
            PoolEntry::Float(_) => "float",
            PoolEntry::Function(_) => "function",
        }
    }
}

impl std::fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEntry::Str(s) => write!(f, "{:?}", s),
            PoolEntry::Float(v) => write!(f, "{}", v),
            PoolEntry::Function(func) => match func.address {
                Some(addr) => write!(
                    f,
                    "{}() @ {} args={} locals={}",
                    func.name, addr, func.nargs, func.nlocals
                ),
                None => write!(f, "{}() <undefined>", func.name),
            },
        }
    }
}

/// Append-only, de-duplicated constant pool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
    index: HashMap<PoolKey, u32>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `entry`, appending it if not already present.
    pub fn intern(&mut self, entry: PoolEntry) -> u32 {
        let key = entry.key();
        if let Some(&index) = self.index.get(&key) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.entries.push(entry);
        self.index.insert(key, index);
        index
    }

    pub fn find(&self, entry: &PoolEntry) -> Option<u32> {
        self.index.get(&entry.key()).copied()
    }

    /// Index of the function slot named `name`, if any.
    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.index
            .get(&PoolKey::Function(name.to_string()))
            .copied()
    }

    /// Replaces the slot at `index` without moving any other entry.
    pub fn replace(&mut self, index: u32, entry: PoolEntry) {
        let Some(slot) = self.entries.get_mut(index as usize) else {
            return;
        };
        let old = std::mem::replace(slot, entry);
        let new_key = self.entries[index as usize].key();
        if old.key() != new_key {
            self.index.remove(&old.key());
            self.index.entry(new_key).or_insert(index);
        }
    }

    pub fn get(&self, index: u32) -> Option<&PoolEntry> {
        self.entries.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionSymbol> {
        self.entries.iter().filter_map(|e| match e {
            PoolEntry::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn into_entries(self) -> Vec<PoolEntry> {
        self.entries
    }
}
