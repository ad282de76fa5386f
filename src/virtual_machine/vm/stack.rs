use crate::virtual_machine::errors::{Fault, FaultKind};
use std::fmt;

/// Operand-stack and storage slot value.
///
/// The machine performs no type checking: arithmetic reads [`Value::raw`]
/// of any slot. The tag only decides which slots hold a counted reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Value {
    /// 32-bit integer, character code or float bit pattern.
    Int(i32),
    /// Heap object id; 0 is null.
    Ref(u32),
    /// Constant-pool index of a string literal.
    Str(u32),
}

impl Value {
    pub const NULL: Value = Value::Ref(0);

    /// The slot's 32-bit pattern.
    pub fn raw(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            Value::Ref(id) | Value::Str(id) => *id as i32,
        }
    }

    /// Object id if this slot holds a counted reference.
    pub fn counted_ref(&self) -> Option<u32> {
        match self {
            Value::Ref(id) if *id != 0 => Some(*id),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Ref(_) => "ref",
            Value::Str(_) => "str",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Ref(0) => f.write_str("null"),
            Value::Ref(id) => write!(f, "@{id}"),
            Value::Str(idx) => write!(f, "str#{idx}"),
        }
    }
}

/// Bounded operand stack.
///
/// Only moves raw values; reference counting is the engine's job.
#[derive(Debug)]
pub(super) struct OperandStack {
    values: Vec<Value>,
    capacity: usize,
}

impl OperandStack {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.values.len()
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn is_full(&self) -> bool {
        self.values.len() >= self.capacity
    }

    pub(super) fn overflow(&self) -> Fault {
        Fault::new(
            FaultKind::StackOverflow,
            format!("operand stack exceeds {} slots", self.capacity),
        )
    }

    pub(super) fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.is_full() {
            return Err(self.overflow());
        }
        self.values.push(value);
        Ok(())
    }

    pub(super) fn pop(&mut self) -> Result<Value, Fault> {
        self.values
            .pop()
            .ok_or_else(|| Fault::new(FaultKind::StackUnderflow, "pop from empty operand stack"))
    }

    pub(super) fn peek(&self) -> Option<Value> {
        self.values.last().copied()
    }

    /// Removes and returns everything above `depth`.
    pub(super) fn truncate(&mut self, depth: usize) -> Vec<Value> {
        if depth >= self.values.len() {
            return Vec::new();
        }
        self.values.split_off(depth)
    }

    pub(super) fn values(&self) -> &[Value] {
        &self.values
    }

    pub(super) fn values_mut(&mut self) -> &mut Vec<Value> {
        &mut self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_bounds() {
        let mut stack = OperandStack::new(2);
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        assert_eq!(stack.push(Value::Int(3)).unwrap_err().kind, FaultKind::StackOverflow);
        assert_eq!(stack.pop().unwrap(), Value::Int(2));
        stack.pop().unwrap();
        assert_eq!(stack.pop().unwrap_err().kind, FaultKind::StackUnderflow);
    }

    #[test]
    fn truncate_returns_dropped_values() {
        let mut stack = OperandStack::new(8);
        for v in 0..5 {
            stack.push(Value::Int(v)).unwrap();
        }
        assert_eq!(stack.truncate(2), vec![Value::Int(2), Value::Int(3), Value::Int(4)]);
        assert_eq!(stack.len(), 2);
        assert!(stack.truncate(4).is_empty());
    }

    #[test]
    fn only_non_null_refs_are_counted() {
        assert_eq!(Value::Ref(3).counted_ref(), Some(3));
        assert_eq!(Value::NULL.counted_ref(), None);
        assert_eq!(Value::Int(3).counted_ref(), None);
        assert_eq!(Value::Str(3).counted_ref(), None);
    }

    #[test]
    fn raw_and_display() {
        assert_eq!(Value::Int(-4).raw(), -4);
        assert_eq!(Value::Ref(7).raw(), 7);
        assert_eq!(Value::NULL.to_string(), "null");
        assert_eq!(Value::Str(1).to_string(), "str#1");
    }
}
