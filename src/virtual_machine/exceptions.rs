//! Fault handler chain.
//!
//! When the engine raises a [`Fault`], the chain is consulted before the
//! machine stops: user handlers in registration order, then built-in
//! handlers in declaration order. The first handler that accepts the fault
//! kind and reports it handled wins, and execution resumes at the next
//! instruction. `StepLimitExceeded` is never offered to handlers.
//!
//! Built-ins only recover arithmetic overflow. Division by zero, stack
//! underflow and memory faults stay fatal unless a user handler intervenes.

use crate::error;
use crate::virtual_machine::errors::{Fault, FaultKind};
use crate::virtual_machine::vm::Value;

/// Restricted view of the machine offered to handlers.
///
/// Handlers can inspect the operand stack and push plain integers, but can
/// never drop or duplicate references.
pub struct Recovery<'a> {
    stack: &'a mut Vec<Value>,
    capacity: usize,
}

impl<'a> Recovery<'a> {
    pub(crate) fn new(stack: &'a mut Vec<Value>, capacity: usize) -> Self {
        Self { stack, capacity }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn peek(&self) -> Option<Value> {
        self.stack.last().copied()
    }

    /// Pushes a substitute result; returns false if the stack is full.
    pub fn push_int(&mut self, value: i32) -> bool {
        if self.stack.len() >= self.capacity {
            return false;
        }
        self.stack.push(Value::Int(value));
        true
    }
}

pub trait FaultHandler: Send {
    fn name(&self) -> &str;

    /// True if this handler wants to see faults of `kind`.
    fn handles(&self, kind: FaultKind) -> bool;

    /// Attempts recovery; returns true if execution may continue.
    fn handle(&mut self, fault: &Fault, recovery: &mut Recovery<'_>) -> bool;
}

/// Replaces an overflowed arithmetic result with 0.
#[derive(Debug, Default)]
pub struct OverflowHandler;

impl FaultHandler for OverflowHandler {
    fn name(&self) -> &str {
        "overflow"
    }

    fn handles(&self, kind: FaultKind) -> bool {
        kind == FaultKind::Overflow
    }

    fn handle(&mut self, _fault: &Fault, recovery: &mut Recovery<'_>) -> bool {
        recovery.push_int(0)
    }
}

/// Reports faults that nothing else recovered; never handles them.
#[derive(Debug, Default)]
pub struct FatalFaultReporter;

impl FaultHandler for FatalFaultReporter {
    fn name(&self) -> &str {
        "fatal-reporter"
    }

    fn handles(&self, kind: FaultKind) -> bool {
        kind != FaultKind::Overflow
    }

    fn handle(&mut self, fault: &Fault, _recovery: &mut Recovery<'_>) -> bool {
        error!("unrecoverable {}", fault);
        false
    }
}

pub struct HandlerChain {
    user: Vec<Box<dyn FaultHandler>>,
    builtin: Vec<Box<dyn FaultHandler>>,
    enabled: bool,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self {
            user: Vec::new(),
            builtin: vec![Box::new(OverflowHandler), Box::new(FatalFaultReporter)],
            enabled: true,
        }
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a user handler; user handlers run before built-ins.
    pub fn register(&mut self, handler: Box<dyn FaultHandler>) {
        self.user.push(handler);
    }

    pub fn clear_user_handlers(&mut self) {
        self.user.clear();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.user
            .iter()
            .chain(self.builtin.iter())
            .map(|h| h.name())
            .collect()
    }

    /// Offers `fault` to each handler in order; returns the name of the
    /// handler that recovered it.
    pub fn dispatch(&mut self, fault: &Fault, recovery: &mut Recovery<'_>) -> Option<String> {
        if !self.enabled || fault.kind == FaultKind::StepLimitExceeded {
            return None;
        }
        for handler in self.user.iter_mut().chain(self.builtin.iter_mut()) {
            if handler.handles(fault.kind) && handler.handle(fault, recovery) {
                return Some(handler.name().to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        kind: FaultKind,
        result: bool,
        seen: Arc<AtomicUsize>,
    }

    impl FaultHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn handles(&self, kind: FaultKind) -> bool {
            kind == self.kind
        }

        fn handle(&mut self, _fault: &Fault, recovery: &mut Recovery<'_>) -> bool {
            self.seen.fetch_add(1, Ordering::Relaxed);
            self.result && recovery.push_int(-1)
        }
    }

    fn fault(kind: FaultKind) -> Fault {
        Fault::new(kind, "").at(3, "iadd")
    }

    #[test]
    fn builtin_recovers_overflow_with_zero() {
        let mut chain = HandlerChain::new();
        let mut stack = Vec::new();
        let mut recovery = Recovery::new(&mut stack, 8);
        assert_eq!(
            chain.dispatch(&fault(FaultKind::Overflow), &mut recovery),
            Some("overflow".to_string())
        );
        assert_eq!(stack, vec![Value::Int(0)]);
    }

    #[test]
    fn builtins_leave_fatal_kinds_unhandled() {
        let mut chain = HandlerChain::new();
        let mut stack = Vec::new();
        for kind in [
            FaultKind::DivisionByZero,
            FaultKind::StackUnderflow,
            FaultKind::MemoryAccessOutOfBounds,
            FaultKind::NullReference,
        ] {
            let mut recovery = Recovery::new(&mut stack, 8);
            assert_eq!(chain.dispatch(&fault(kind), &mut recovery), None);
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn user_handler_runs_first() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut chain = HandlerChain::new();
        chain.register(Box::new(Counting {
            kind: FaultKind::Overflow,
            result: true,
            seen: seen.clone(),
        }));
        let mut stack = Vec::new();
        let mut recovery = Recovery::new(&mut stack, 8);
        assert_eq!(
            chain.dispatch(&fault(FaultKind::Overflow), &mut recovery),
            Some("counting".to_string())
        );
        assert_eq!(stack, vec![Value::Int(-1)]);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn declining_user_handler_falls_through() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut chain = HandlerChain::new();
        chain.register(Box::new(Counting {
            kind: FaultKind::Overflow,
            result: false,
            seen: seen.clone(),
        }));
        let mut stack = Vec::new();
        let mut recovery = Recovery::new(&mut stack, 8);
        assert_eq!(
            chain.dispatch(&fault(FaultKind::Overflow), &mut recovery),
            Some("overflow".to_string())
        );
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn user_handler_can_recover_division_by_zero() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut chain = HandlerChain::new();
        chain.register(Box::new(Counting {
            kind: FaultKind::DivisionByZero,
            result: true,
            seen,
        }));
        let mut stack = Vec::new();
        let mut recovery = Recovery::new(&mut stack, 8);
        assert!(
            chain
                .dispatch(&fault(FaultKind::DivisionByZero), &mut recovery)
                .is_some()
        );
    }

    #[test]
    fn disabled_chain_and_step_limit_bypass() {
        let mut chain = HandlerChain::new();
        let mut stack = Vec::new();
        let mut recovery = Recovery::new(&mut stack, 8);
        assert_eq!(
            chain.dispatch(&fault(FaultKind::StepLimitExceeded), &mut recovery),
            None
        );
        chain.set_enabled(false);
        assert_eq!(chain.dispatch(&fault(FaultKind::Overflow), &mut recovery), None);
        assert!(!chain.is_enabled());
    }

    #[test]
    fn recovery_respects_capacity() {
        let mut stack = vec![Value::Int(1)];
        let mut recovery = Recovery::new(&mut stack, 1);
        assert!(!recovery.push_int(0));
        assert_eq!(recovery.depth(), 1);
        assert_eq!(recovery.peek(), Some(Value::Int(1)));
    }

    #[test]
    fn handler_order_is_user_then_builtin() {
        let mut chain = HandlerChain::new();
        chain.register(Box::new(OverflowHandler));
        assert_eq!(
            chain.handler_names(),
            vec!["overflow", "overflow", "fatal-reporter"]
        );
        chain.clear_user_handlers();
        assert_eq!(chain.handler_names().len(), 2);
    }
}
