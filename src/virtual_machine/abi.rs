//! Calling convention, call frames and frame layout.
//!
//! # Call protocol
//!
//! `call f`:
//! 1. Pop `f.nargs` arguments (last argument on top) into the callee's locals.
//! 2. Stash the caller's remaining operand-stack depth in the caller's frame.
//! 3. Push a frame whose return address is `pc + width` and jump to `f`.
//!
//! `ret`:
//! 1. Pop the frame and read the depth stashed by the matching `call`.
//! 2. If the stack is deeper than that depth, the top value is the result.
//! 3. Drop everything above the saved depth, then push the result.
//! 4. Jump to the return address, or halt on the halt sentinel.
//!
//! So after a balanced call the caller's stack is exactly one value deeper
//! than before it pushed the arguments, or unchanged if the callee returned
//! nothing.
//!
//! # Frame layout
//!
//! Byte-level layout used by tooling and the register convention:
//!
//! ```text
//! +0   return address          (8 bytes)
//! +8   saved frame pointer     (8 bytes)
//! +16  locals                  (8 bytes each, area aligned to 16)
//! ...  temporaries             (max(64, nlocals * 4) bytes)
//! ...  callee-saved registers  (register convention only, 8 bytes each)
//! ```
//!
//! Parameters are addressed upward from the return-address slot in the
//! caller's area: parameter `i` lives at `8 + i * 8`.

use crate::virtual_machine::errors::{Fault, FaultKind};
use crate::virtual_machine::symbols::FunctionSymbol;
use crate::virtual_machine::vm::Value;
use std::collections::HashMap;

pub const RETURN_ADDRESS_SIZE: usize = 8;
pub const SAVED_FP_OFFSET: usize = 8;
pub const SLOT_SIZE: usize = 8;
pub const FRAME_ALIGNMENT: usize = 16;
pub const MIN_TEMP_AREA: usize = 64;

/// Debug-bag key holding the caller's operand-stack depth across a call.
pub const SAVED_STACK_DEPTH: &str = "saved_stack_depth";

pub const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Where a frame returns to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnAddress {
    /// Returning from this frame halts the machine.
    Halt,
    At(usize),
}

/// One active invocation.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// Called function; `None` for the anonymous entry frame.
    pub function: Option<FunctionSymbol>,
    pub return_address: ReturnAddress,
    /// Arguments followed by declared locals.
    pub locals: Vec<Value>,
    /// Auxiliary values stashed across calls.
    pub debug: HashMap<String, i64>,
}

impl StackFrame {
    pub fn new(
        function: Option<FunctionSymbol>,
        return_address: ReturnAddress,
        locals: Vec<Value>,
    ) -> Self {
        Self {
            function,
            return_address,
            locals,
            debug: HashMap::new(),
        }
    }

    /// Entry frame that halts on return.
    pub fn entry(function: Option<FunctionSymbol>) -> Self {
        let slots = function.as_ref().map_or(0, FunctionSymbol::frame_slots);
        Self::new(function, ReturnAddress::Halt, vec![Value::Int(0); slots])
    }

    pub fn name(&self) -> &str {
        self.function.as_ref().map_or("<entry>", |f| f.name.as_str())
    }

    pub fn saved_stack_depth(&self) -> Option<usize> {
        self.debug
            .get(SAVED_STACK_DEPTH)
            .and_then(|d| usize::try_from(*d).ok())
    }
}

/// LIFO stack of frames bounded by `max_frames`.
#[derive(Debug)]
pub struct FrameStack {
    frames: Vec<StackFrame>,
    max_frames: usize,
}

impl FrameStack {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_frames,
        }
    }

    pub fn push(&mut self, frame: StackFrame) -> Result<(), Fault> {
        if self.frames.len() >= self.max_frames {
            return Err(Fault::new(
                FaultKind::StackOverflow,
                format!("call depth exceeds {} frames", self.max_frames),
            ));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<StackFrame, Fault> {
        self.frames
            .pop()
            .ok_or_else(|| Fault::new(FaultKind::StackUnderflow, "return with no active frame"))
    }

    pub fn current(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from outermost to innermost.
    pub fn iter(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter()
    }

    pub fn drain(&mut self) -> Vec<StackFrame> {
        std::mem::take(&mut self.frames)
    }
}

/// Pushes the callee frame for `function` and returns its entry address.
///
/// `args` are in source order; `caller_depth` is the caller's operand-stack
/// depth after the arguments were popped.
pub fn enter(
    frames: &mut FrameStack,
    function: &FunctionSymbol,
    args: Vec<Value>,
    return_pc: usize,
    caller_depth: usize,
) -> Result<usize, Fault> {
    let target = function.address.ok_or_else(|| {
        Fault::new(
            FaultKind::InvalidJumpTarget,
            format!("function {} has no address", function.name),
        )
    })? as usize;

    let mut locals = args;
    locals.resize(function.frame_slots(), Value::Int(0));
    let frame = StackFrame::new(
        Some(function.clone()),
        ReturnAddress::At(return_pc),
        locals,
    );
    frames.push(frame)?;
    let depth = frames.depth();
    if depth >= 2
        && let Some(caller) = frames.frames.get_mut(depth - 2)
    {
        caller
            .debug
            .insert(SAVED_STACK_DEPTH.to_string(), caller_depth as i64);
    }
    Ok(target)
}

/// What `ret` must do to the operand stack and program counter.
#[derive(Debug)]
pub struct ReturnPlan {
    /// The popped frame; its locals must be released by the caller.
    pub frame: StackFrame,
    /// Depth to restore; `None` when returning from the entry frame.
    pub saved_depth: Option<usize>,
    pub return_address: ReturnAddress,
}

impl ReturnPlan {
    /// True if the top of a stack of `depth` values is a return value.
    pub fn has_value(&self, depth: usize) -> bool {
        match self.saved_depth {
            Some(saved) => depth > saved,
            None => depth > 0,
        }
    }
}

/// Pops the active frame and recovers the caller's saved depth.
pub fn leave(frames: &mut FrameStack) -> Result<ReturnPlan, Fault> {
    let frame = frames.pop()?;
    let saved_depth = frames
        .current_mut()
        .and_then(|caller| caller.debug.remove(SAVED_STACK_DEPTH))
        .and_then(|d| usize::try_from(d).ok());
    Ok(ReturnPlan {
        return_address: frame.return_address,
        frame,
        saved_depth,
    })
}

/// How arguments reach the callee.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArgumentPassing {
    /// All arguments on the operand stack.
    Stack,
    /// First `window` arguments in registers starting at `first`, rest spilled.
    Registers { first: u8, window: u8 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CallingConvention {
    pub passing: ArgumentPassing,
    /// Callee-saved registers preserved in the frame.
    pub callee_saved: u8,
}

impl CallingConvention {
    pub const STACK: CallingConvention = CallingConvention {
        passing: ArgumentPassing::Stack,
        callee_saved: 0,
    };

    /// Register convention: `a0..a7` in r10..r17, `s0..s11` callee-saved.
    pub const REGISTER: CallingConvention = CallingConvention {
        passing: ArgumentPassing::Registers {
            first: 10,
            window: 8,
        },
        callee_saved: 12,
    };

    pub fn argument_location(&self, index: usize) -> ArgumentLocation {
        match self.passing {
            ArgumentPassing::Registers { first, window } if index < window as usize => {
                ArgumentLocation::Register(first + index as u8)
            }
            ArgumentPassing::Registers { window, .. } => {
                ArgumentLocation::Stack(param_offset(index - window as usize))
            }
            ArgumentPassing::Stack => ArgumentLocation::Stack(param_offset(index)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArgumentLocation {
    Register(u8),
    /// Byte offset from the frame's return-address slot.
    Stack(usize),
}

/// Byte offset of parameter `index`.
pub const fn param_offset(index: usize) -> usize {
    RETURN_ADDRESS_SIZE + index * SLOT_SIZE
}

/// Byte offset of local `index`.
pub const fn local_offset(index: usize) -> usize {
    align_up(SAVED_FP_OFFSET + SLOT_SIZE, FRAME_ALIGNMENT) + index * SLOT_SIZE
}

/// Byte-level layout of one frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameLayout {
    pub nlocals: usize,
    pub locals_offset: usize,
    pub temp_offset: usize,
    pub temp_size: usize,
    pub callee_saved_offset: usize,
    pub callee_saved_size: usize,
    pub frame_size: usize,
}

impl FrameLayout {
    pub fn compute(nlocals: usize, convention: &CallingConvention) -> Self {
        let locals_offset = local_offset(0);
        let temp_offset = locals_offset + nlocals * SLOT_SIZE;
        let temp_size = MIN_TEMP_AREA.max(nlocals * 4);
        let base = align_up(temp_offset + temp_size, FRAME_ALIGNMENT);
        let callee_saved_size = convention.callee_saved as usize * SLOT_SIZE;
        Self {
            nlocals,
            locals_offset,
            temp_offset,
            temp_size,
            callee_saved_offset: base,
            callee_saved_size,
            frame_size: align_up(base + callee_saved_size, FRAME_ALIGNMENT),
        }
    }

    pub fn for_function(function: &FunctionSymbol, convention: &CallingConvention) -> Self {
        Self::compute(function.frame_slots(), convention)
    }

    /// Returns every layout rule this layout breaks.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.frame_size % FRAME_ALIGNMENT != 0 {
            errors.push(format!(
                "frame size {} is not aligned to {}",
                self.frame_size, FRAME_ALIGNMENT
            ));
        }
        if self.locals_offset < SAVED_FP_OFFSET + SLOT_SIZE {
            errors.push(format!(
                "locals at {} overlap the saved frame pointer",
                self.locals_offset
            ));
        }
        if self.temp_offset < self.locals_offset + self.nlocals * SLOT_SIZE {
            errors.push("temporary area overlaps locals".to_string());
        }
        if self.callee_saved_offset < self.temp_offset + self.temp_size {
            errors.push("callee-saved area overlaps temporaries".to_string());
        }
        if self.callee_saved_offset + self.callee_saved_size > self.frame_size {
            errors.push(format!(
                "frame size {} too small for callee-saved area",
                self.frame_size
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(nargs: u16, nlocals: u16, address: u32) -> FunctionSymbol {
        FunctionSymbol {
            name: "f".into(),
            nargs,
            nlocals,
            address: Some(address),
        }
    }

    #[test]
    fn enter_stashes_caller_depth() {
        let mut frames = FrameStack::new(4);
        frames.push(StackFrame::entry(None)).unwrap();
        let target = enter(
            &mut frames,
            &func(2, 1, 10),
            vec![Value::Int(2), Value::Int(3)],
            5,
            7,
        )
        .unwrap();
        assert_eq!(target, 10);
        assert_eq!(frames.depth(), 2);
        let callee = frames.current().unwrap();
        assert_eq!(callee.locals, vec![Value::Int(2), Value::Int(3), Value::Int(0)]);
        assert_eq!(callee.return_address, ReturnAddress::At(5));

        let plan = leave(&mut frames).unwrap();
        assert_eq!(plan.saved_depth, Some(7));
        assert_eq!(plan.return_address, ReturnAddress::At(5));
        assert!(plan.has_value(8));
        assert!(!plan.has_value(7));
        // the stash is consumed by the matching return
        assert_eq!(frames.current().unwrap().saved_stack_depth(), None);
    }

    #[test]
    fn leave_entry_frame_halts() {
        let mut frames = FrameStack::new(2);
        frames.push(StackFrame::entry(None)).unwrap();
        let plan = leave(&mut frames).unwrap();
        assert_eq!(plan.return_address, ReturnAddress::Halt);
        assert_eq!(plan.saved_depth, None);
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_limit_overflows() {
        let mut frames = FrameStack::new(1);
        frames.push(StackFrame::entry(None)).unwrap();
        let err = enter(&mut frames, &func(0, 0, 0), vec![], 1, 0).unwrap_err();
        assert_eq!(err.kind, FaultKind::StackOverflow);
    }

    #[test]
    fn leave_without_frame_underflows() {
        let mut frames = FrameStack::new(1);
        assert_eq!(leave(&mut frames).unwrap_err().kind, FaultKind::StackUnderflow);
    }

    #[test]
    fn undefined_function_is_bad_target() {
        let mut frames = FrameStack::new(2);
        let err = enter(&mut frames, &FunctionSymbol::forward("g"), vec![], 0, 0).unwrap_err();
        assert_eq!(err.kind, FaultKind::InvalidJumpTarget);
    }

    #[test]
    fn offsets() {
        assert_eq!(param_offset(0), 8);
        assert_eq!(param_offset(2), 24);
        assert_eq!(local_offset(0), 16);
        assert_eq!(local_offset(3), 40);
    }

    #[test]
    fn stack_layout_sizes() {
        let layout = FrameLayout::compute(2, &CallingConvention::STACK);
        // 16 header + 16 locals + 64 temps = 96
        assert_eq!(layout.frame_size, 96);
        assert!(layout.validate().is_empty());

        let big = FrameLayout::compute(20, &CallingConvention::STACK);
        // 16 + 160 + 80 = 256
        assert_eq!(big.temp_size, 80);
        assert_eq!(big.frame_size, 256);
    }

    #[test]
    fn register_layout_adds_callee_saved_area() {
        let layout = FrameLayout::compute(1, &CallingConvention::REGISTER);
        // align16(16 + 8 + 64) = 96, + 12 * 8 = 192
        assert_eq!(layout.callee_saved_offset, 96);
        assert_eq!(layout.frame_size, 192);
        assert!(layout.validate().is_empty());
    }

    #[test]
    fn validate_reports_broken_layout() {
        let mut layout = FrameLayout::compute(1, &CallingConvention::STACK);
        layout.frame_size += 4;
        layout.locals_offset = 8;
        let errors = layout.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("not aligned"));
    }

    #[test]
    fn register_window_spills_to_stack() {
        let cc = CallingConvention::REGISTER;
        assert_eq!(cc.argument_location(0), ArgumentLocation::Register(10));
        assert_eq!(cc.argument_location(7), ArgumentLocation::Register(17));
        assert_eq!(cc.argument_location(8), ArgumentLocation::Stack(8));
        assert_eq!(
            CallingConvention::STACK.argument_location(1),
            ArgumentLocation::Stack(16)
        );
    }
}
