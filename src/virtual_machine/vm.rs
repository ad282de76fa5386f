//! Core virtual machine implementation.
//!
//! The VM executes word-encoded stack bytecode: fetch the word at `pc`,
//! decode it, advance `pc` past it (unless the instruction transfers control
//! itself), then dispatch to an `op_*` handler. Handlers report problems as
//! [`Fault`]s; the engine offers each fault to the [`HandlerChain`], records
//! it in the [`FaultMonitor`], and stops only if nothing recovered it.
//!
//! Heap objects are reference counted. Every operand-stack slot and every
//! storage slot (locals, globals, struct fields) holding a non-null
//! [`Value::Ref`] owns one reference:
//! - a push retains, a pop that consumes the value releases;
//! - moving a popped value into a storage slot transfers ownership;
//! - loading from a storage slot retains, overwriting releases the old value;
//! - an object whose count reaches zero releases its own fields.

mod heap;
mod stack;
mod stats;

pub use heap::StructValue;
pub use stack::Value;
pub use stats::{BranchStats, ExecutionStats};

use crate::virtual_machine::abi::{self, FrameStack, ReturnAddress, StackFrame};
use crate::virtual_machine::codec::{Decoded, decode_at};
use crate::virtual_machine::config::VMConfig;
use crate::virtual_machine::disasm;
use crate::virtual_machine::errors::{Fault, FaultKind, VMError};
use crate::virtual_machine::exceptions::{FaultHandler, HandlerChain, Recovery};
use crate::virtual_machine::gc::{GarbageCollector, GcStats, NULL_ID, NoOpGc, RefCountingGc, Release};
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::monitor::FaultMonitor;
use crate::virtual_machine::program::Program;
use crate::virtual_machine::symbols::PoolEntry;
use crate::{debug, error, info, warn};
use heap::Heap;
use stack::OperandStack;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Lifecycle of a loaded program.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MachineState {
    /// Loaded (or reset) and not yet started.
    Idle,
    Running,
    /// Stopped at a breakpoint, after a single step, or by request.
    Paused,
    /// Finished normally or stopped by request.
    Halted,
    /// Stopped by an unrecovered fault.
    Faulted,
}

impl MachineState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "idle",
            MachineState::Running => "running",
            MachineState::Paused => "paused",
            MachineState::Halted => "halted",
            MachineState::Faulted => "faulted",
        }
    }

    /// True once the machine can make no further progress without a reset.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Halted | MachineState::Faulted)
    }
}

/// Why a call to [`VM::run`] or [`VM::run_slice`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Halted,
    /// Stopped before executing the instruction at this address.
    Breakpoint(usize),
    /// Cycle budget used up; the machine is still running.
    Yielded,
}

/// Destination of `print`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputSink {
    #[default]
    Stdout,
    /// Collects output in memory.
    Capture(String),
}

/// Bytecode virtual machine.
///
/// Owns one loaded [`Program`] and all of its runtime state. A VM is driven
/// either to completion with [`VM::execute`] or incrementally with
/// [`VM::step`], [`VM::run`] and [`VM::run_slice`] under a debugger.
pub struct VM {
    config: VMConfig,
    program: Program,
    loaded: bool,
    state: MachineState,
    /// Address of the next instruction to fetch.
    pc: usize,
    /// Address following the instruction being executed.
    next_pc: usize,
    /// Address and mnemonic of the instruction being executed.
    instr_pc: usize,
    instr_name: &'static str,
    stack: OperandStack,
    frames: FrameStack,
    globals: Vec<Value>,
    heap: Heap,
    gc: Box<dyn GarbageCollector>,
    handlers: HandlerChain,
    monitor: FaultMonitor,
    stats: ExecutionStats,
    steps: u64,
    breakpoints: BTreeSet<usize>,
    /// Set when paused on a breakpoint so the next run executes it.
    resume_from_breakpoint: bool,
    output: OutputSink,
    last_fault: Option<Fault>,
}

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        decoded = $decoded:ident,
        { $( $( $variant:ident )|+ => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $decoded.instruction {
            $(
                $( Instruction::$variant )|+ => exec_vm!(@call $vm, $decoded, $handler, $args),
            )*
        }
    }};

    // Handler that inspects the raw decoded instruction
    (@call $vm:ident, $decoded:ident, $handler:ident, (decoded)) => {
        $vm.$handler($decoded)
    };

    (@call $vm:ident, $decoded:ident, $handler:ident, ()) => {
        $vm.$handler()
    };

    (@call $vm:ident, $decoded:ident, $handler:ident, ( $field:ident : $kind:ident )) => {{
        let $field = exec_vm!(@read $decoded, $kind);
        $vm.$handler($field)
    }};

    // Signed integer operand, branch target, slot or field index
    (@read $decoded:ident, Int) => { $decoded.immediate() };

    // Constant-pool index
    (@read $decoded:ident, Pool) => { $decoded.immediate() };

    // Constant-pool index of a function symbol
    (@read $decoded:ident, Func) => { $decoded.immediate() };
}

fn make_collector(config: &VMConfig) -> Box<dyn GarbageCollector> {
    if config.uses_refcounting() {
        Box::new(RefCountingGc::new())
    } else {
        Box::new(NoOpGc::new())
    }
}

/// Index into a slot array of `len` entries, or `MemoryAccessOutOfBounds`.
fn slot_index(index: i32, len: usize, what: &str) -> Result<usize, Fault> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| {
            Fault::new(
                FaultKind::MemoryAccessOutOfBounds,
                format!("{what} {index} outside 0..{len}"),
            )
            .with_address(index as i64)
        })
}

fn no_frame() -> Fault {
    Fault::new(FaultKind::StackUnderflow, "no active frame")
}

/// Object id named by a slot value; integers are reinterpreted as ids.
fn object_id(value: Value) -> u32 {
    match value {
        Value::Ref(id) => id,
        Value::Int(raw) => raw as u32,
        Value::Str(_) => NULL_ID,
    }
}

impl VM {
    /// Creates an empty machine; load a program before running it.
    pub fn new(config: VMConfig) -> Result<Self, VMError> {
        config.validate()?;
        Ok(Self {
            program: Program::default(),
            loaded: false,
            state: MachineState::Idle,
            pc: 0,
            next_pc: 0,
            instr_pc: 0,
            instr_name: "?",
            stack: OperandStack::new(config.stack_size),
            frames: FrameStack::new(config.max_frames),
            globals: Vec::new(),
            heap: Heap::new(config.heap_fields()),
            gc: make_collector(&config),
            handlers: HandlerChain::new(),
            monitor: FaultMonitor::new(),
            stats: ExecutionStats::default(),
            steps: 0,
            breakpoints: BTreeSet::new(),
            resume_from_breakpoint: false,
            output: OutputSink::Stdout,
            last_fault: None,
            config,
        })
    }

    /// Creates a machine with `program` already loaded.
    pub fn with_program(config: VMConfig, program: Program) -> Result<Self, VMError> {
        let mut vm = Self::new(config)?;
        vm.load(program)?;
        Ok(vm)
    }

    /// Replaces the loaded program and resets all runtime state.
    ///
    /// Breakpoints from a previous program are cleared.
    pub fn load(&mut self, program: Program) -> Result<(), VMError> {
        if program.code.is_empty() {
            return Err(VMError::EmptyProgram);
        }
        if program.code.len() > self.config.instruction_cache_size {
            return Err(VMError::ProgramTooLarge {
                words: program.code.len(),
                limit: self.config.instruction_cache_size,
            });
        }
        if self.config.debug {
            info!(
                "loaded program: {} words, {} constants, {} globals",
                program.code.len(),
                program.constant_pool.len(),
                program.global_slots()
            );
        }
        self.program = program;
        self.loaded = true;
        self.breakpoints.clear();
        self.reset_state()
    }

    /// Loads either a program artifact or raw bytecode.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), VMError> {
        self.load(Program::load(bytes)?)
    }

    /// Loads `program` and runs it to completion, ignoring breakpoints.
    ///
    /// Returns the top of the operand stack at halt, or 0 if it is empty.
    pub fn execute(&mut self, program: Program) -> Result<i32, VMError> {
        self.load(program)?;
        self.run_inner(u64::MAX, false)?;
        Ok(self.stack.peek().map_or(0, |v| v.raw()))
    }

    /// Restarts the loaded program from its entry point.
    ///
    /// Keeps the program, breakpoints, registered handlers and output sink.
    pub fn reset(&mut self) -> Result<(), VMError> {
        if !self.loaded {
            return Err(VMError::NoProgram);
        }
        self.reset_state()
    }

    fn reset_state(&mut self) -> Result<(), VMError> {
        self.stack.values_mut().clear();
        self.frames.drain();
        self.heap.clear();
        self.gc.reset();
        self.globals = vec![Value::Int(0); self.program.global_slots()];
        self.monitor.reset();
        self.stats = ExecutionStats::default();
        self.steps = 0;
        self.last_fault = None;
        self.resume_from_breakpoint = false;
        self.instr_name = "?";

        let main = self
            .program
            .main
            .and_then(|address| self.program.function_at(address))
            .cloned();
        self.frames.push(StackFrame::entry(main))?;
        self.stats.max_frame_depth = self.frames.depth();

        self.pc = self.program.entry_point();
        self.next_pc = self.pc;
        self.instr_pc = self.pc;
        self.state = MachineState::Idle;
        Ok(())
    }

    /// Runs until halt or a breakpoint.
    pub fn run(&mut self) -> Result<RunOutcome, VMError> {
        self.run_inner(u64::MAX, true)
    }

    /// Runs at most `budget` cycles, stopping early at halt or a breakpoint.
    pub fn run_slice(&mut self, budget: u64) -> Result<RunOutcome, VMError> {
        self.run_inner(budget, true)
    }

    fn run_inner(&mut self, budget: u64, honor_breakpoints: bool) -> Result<RunOutcome, VMError> {
        self.ensure_runnable("run")?;
        self.state = MachineState::Running;
        let mut cycles = 0u64;
        while self.state == MachineState::Running {
            if cycles == budget {
                return Ok(RunOutcome::Yielded);
            }
            if honor_breakpoints && self.breakpoints.contains(&self.pc) {
                if self.resume_from_breakpoint {
                    self.resume_from_breakpoint = false;
                } else {
                    self.resume_from_breakpoint = true;
                    self.state = MachineState::Paused;
                    if self.config.debug {
                        debug!("breakpoint hit at {}", self.pc);
                    }
                    return Ok(RunOutcome::Breakpoint(self.pc));
                }
            }
            self.cycle()?;
            cycles += 1;
        }
        Ok(RunOutcome::Halted)
    }

    /// Executes exactly one instruction and returns the resulting state.
    ///
    /// A machine that has not halted is left paused.
    pub fn step(&mut self) -> Result<MachineState, VMError> {
        self.ensure_runnable("step")?;
        self.resume_from_breakpoint = false;
        self.state = MachineState::Running;
        self.cycle()?;
        if self.state == MachineState::Running {
            self.state = MachineState::Paused;
        }
        Ok(self.state)
    }

    /// Pauses a running or idle machine.
    pub fn pause(&mut self) -> Result<(), VMError> {
        match self.state {
            MachineState::Running | MachineState::Idle => {
                self.state = MachineState::Paused;
                Ok(())
            }
            MachineState::Paused => Ok(()),
            other => Err(VMError::InvalidState {
                operation: "pause",
                state: other.as_str(),
            }),
        }
    }

    /// Stops the machine; only a reset or a new load restarts it.
    pub fn stop(&mut self) {
        if self.state != MachineState::Faulted {
            self.state = MachineState::Halted;
        }
    }

    fn ensure_runnable(&self, operation: &'static str) -> Result<(), VMError> {
        if !self.loaded {
            return Err(VMError::NoProgram);
        }
        if self.state.is_terminal() {
            return Err(VMError::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// One fetch-decode-execute cycle.
    fn cycle(&mut self) -> Result<(), Fault> {
        let pc = self.pc;
        let len = self.program.code.len();
        if pc == len {
            self.finish("end of code");
            return Ok(());
        }

        if let Some(limit) = self.config.max_steps
            && self.steps >= limit
        {
            let name = decode_at(&self.program.code, pc).map_or("?", |d| d.instruction.mnemonic());
            let fault = Fault::new(
                FaultKind::StepLimitExceeded,
                format!("executed {limit} instructions"),
            );
            return self.raise(fault.at(pc, name));
        }
        self.instr_pc = pc;

        let decoded = match decode_at(&self.program.code, pc) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.instr_name = "?";
                self.next_pc = pc + 1;
                let fault = match err {
                    VMError::MissingOperandWord { .. } => {
                        Fault::new(FaultKind::MemoryAccessOutOfBounds, err.to_string())
                            .with_address(pc as i64 + 1)
                    }
                    VMError::InvalidInstruction { opcode, .. } => {
                        Fault::new(FaultKind::InvalidOpcode, err.to_string())
                            .with_address(opcode as i64)
                    }
                    other => Fault::new(FaultKind::InvalidJumpTarget, other.to_string())
                        .with_address(pc as i64),
                };
                self.steps += 1;
                return self.raise(fault.at(pc, "?"));
            }
        };

        self.instr_name = decoded.instruction.mnemonic();
        self.next_pc = pc + decoded.width;
        self.steps += 1;
        self.stats.record_instruction(decoded.instruction);
        if self.config.trace {
            debug!(
                "{:>5}  {:<28} stack={:?}",
                pc,
                disasm::format_decoded(&self.program, &decoded),
                self.stack.values()
            );
        }

        if !decoded.instruction.is_control_transfer() {
            self.pc = self.next_pc;
        }
        match self.exec(decoded) {
            Ok(()) => Ok(()),
            Err(fault) => self.raise(fault.at(pc, self.instr_name)),
        }
    }

    /// Routes a fault through the handler chain.
    ///
    /// A recovered fault resumes at the instruction after the faulting one.
    fn raise(&mut self, fault: Fault) -> Result<(), Fault> {
        let capacity = self.stack.capacity();
        let mut recovery = Recovery::new(self.stack.values_mut(), capacity);
        let handled_by = self.handlers.dispatch(&fault, &mut recovery);
        self.monitor.record(&fault, handled_by.is_some());

        if let Some(handler) = handled_by {
            warn!("recovered {} via {}", fault, handler);
            self.stats.record_stack_depth(self.stack.len());
            self.pc = self.next_pc;
            return Ok(());
        }

        self.state = MachineState::Faulted;
        self.last_fault = Some(fault.clone());
        if self.config.verbose_errors {
            error!("{}", self.core_dump());
        }
        Err(fault)
    }

    fn finish(&mut self, reason: &str) {
        self.state = MachineState::Halted;
        if self.config.debug {
            debug!("halted at {} ({}) after {} steps", self.pc, reason, self.steps);
        }
    }

    /// Executes a single decoded instruction.
    fn exec(&mut self, decoded: Decoded) -> Result<(), Fault> {
        exec_vm! {
            vm = self,
            decoded = decoded,
            {
                // Integer arithmetic
                Iadd => op_iadd(),
                Isub => op_isub(),
                Imul => op_imul(),
                Idiv => op_idiv(),
                Imod => op_imod(),
                Ineg => op_ineg(),
                // Integer comparison / logic
                Ilt => op_ilt(),
                Ile => op_ile(),
                Igt => op_igt(),
                Ige => op_ige(),
                Ieq => op_ieq(),
                Ine => op_ine(),
                Inot => op_inot(),
                Iand => op_iand(),
                Ior => op_ior(),
                Ixor => op_ixor(),
                // Float arithmetic
                Fadd => op_fadd(),
                Fsub => op_fsub(),
                Fmul => op_fmul(),
                Fdiv => op_fdiv(),
                Flt => op_flt(),
                Feq => op_feq(),
                Itof => op_itof(),
                // Control flow
                Call => op_call(function: Func),
                Ret => op_ret(),
                Br => op_br(target: Int),
                Brt => op_brt(target: Int),
                Brf => op_brf(target: Int),
                // Constants
                Cconst => op_cconst(value: Int),
                Iconst => op_iconst(value: Int),
                Fconst => op_fconst(constant: Pool),
                Sconst => op_sconst(constant: Pool),
                // Memory
                Load => op_load(slot: Int),
                Gload => op_gload(slot: Int),
                Fload => op_fload(field: Int),
                Store => op_store(slot: Int),
                Gstore => op_gstore(slot: Int),
                Fstore => op_fstore(field: Int),
                // Misc
                Print => op_print(),
                Struct => op_struct(fields: Int),
                Null => op_null(),
                Pop => op_pop(),
                Dup => op_dup(),
                Nop => op_nop(),
                Halt => op_halt(),
                // Register layout
                Mov | Li | Lw | Sw | Add | Sub | Mul | Div | Slt | Sle | Sgt | Sge | Seq | Sne
                    | Jf => op_register_form(decoded),
            }
        }
    }

    // ==================== Reference counting ====================

    fn retain(&mut self, value: Value) -> Result<(), Fault> {
        if let Some(id) = value.counted_ref() {
            self.gc.increment(id).map_err(|err| {
                Fault::new(FaultKind::NullReference, err.to_string()).with_address(id as i64)
            })?;
        }
        Ok(())
    }

    fn decrement(&mut self, id: u32) -> Result<Release, Fault> {
        self.gc
            .decrement(id)
            .map_err(|err| Fault::new(FaultKind::NullReference, err.to_string()).with_address(id as i64))
    }

    /// Drops one reference, freeing objects whose count reaches zero.
    fn release(&mut self, value: Value) -> Result<(), Fault> {
        let Some(id) = value.counted_ref() else {
            return Ok(());
        };
        let mut dying = Vec::new();
        if self.decrement(id)? == Release::Dead {
            dying.push(id);
        }
        while let Some(id) = dying.pop() {
            let Some(object) = self.heap.remove(id) else {
                continue;
            };
            for field in object.fields {
                if let Some(child) = field.counted_ref()
                    && self.decrement(child)? == Release::Dead
                {
                    dying.push(child);
                }
            }
        }
        Ok(())
    }

    /// Releases every value, reporting the first failure.
    fn release_all(&mut self, values: Vec<Value>) -> Result<(), Fault> {
        let mut result = Ok(());
        for value in values {
            if let Err(fault) = self.release(value)
                && result.is_ok()
            {
                result = Err(fault);
            }
        }
        result
    }

    // ==================== Operand stack ====================

    /// Pushes a copy of `value`, taking a new reference.
    fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.stack.is_full() {
            return Err(self.stack.overflow());
        }
        self.retain(value)?;
        self.push_owned(value)
    }

    /// Pushes a value whose reference the caller already owns.
    fn push_owned(&mut self, value: Value) -> Result<(), Fault> {
        self.stack.push(value)?;
        self.stats.record_stack_depth(self.stack.len());
        Ok(())
    }

    fn push_int(&mut self, value: i32) -> Result<(), Fault> {
        self.push_owned(Value::Int(value))
    }

    fn push_bool(&mut self, value: bool) -> Result<(), Fault> {
        self.push_int(value as i32)
    }

    fn pop_int(&mut self) -> Result<i32, Fault> {
        let value = self.stack.pop()?;
        self.release(value)?;
        Ok(value.raw())
    }

    fn pop_float(&mut self) -> Result<f32, Fault> {
        Ok(f32::from_bits(self.pop_int()? as u32))
    }

    fn push_float(&mut self, value: f32) -> Result<(), Fault> {
        self.push_int(value.to_bits() as i32)
    }

    // ==================== Operation helpers ====================

    fn checked_int(&mut self, symbol: &str, op: fn(i32, i32) -> Option<i32>) -> Result<(), Fault> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        match op(left, right) {
            Some(result) => self.push_int(result),
            None => Err(Fault::new(
                FaultKind::Overflow,
                format!("{left} {symbol} {right} overflows i32"),
            )),
        }
    }

    fn divide(&mut self, symbol: &str, op: fn(i32, i32) -> Option<i32>) -> Result<(), Fault> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        if right == 0 {
            return Err(Fault::new(
                FaultKind::DivisionByZero,
                format!("{left} {symbol} 0"),
            ));
        }
        match op(left, right) {
            Some(result) => self.push_int(result),
            None => Err(Fault::new(
                FaultKind::Overflow,
                format!("{left} {symbol} {right} overflows i32"),
            )),
        }
    }

    fn int_op(&mut self, op: fn(i32, i32) -> i32) -> Result<(), Fault> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        self.push_int(op(left, right))
    }

    fn compare(&mut self, op: fn(i32, i32) -> bool) -> Result<(), Fault> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        self.push_bool(op(left, right))
    }

    fn float_op(&mut self, op: fn(f32, f32) -> f32) -> Result<(), Fault> {
        let right = self.pop_float()?;
        let left = self.pop_float()?;
        self.push_float(op(left, right))
    }

    fn float_compare(&mut self, op: fn(f32, f32) -> bool) -> Result<(), Fault> {
        let right = self.pop_float()?;
        let left = self.pop_float()?;
        self.push_bool(op(left, right))
    }

    fn jump_target(&self, target: i32) -> Result<usize, Fault> {
        let len = self.program.code.len();
        usize::try_from(target)
            .ok()
            .filter(|t| *t < len)
            .ok_or_else(|| {
                Fault::new(
                    FaultKind::InvalidJumpTarget,
                    format!("target {target} outside 0..{len}"),
                )
                .with_address(target as i64)
            })
    }

    fn locals_mut(&mut self) -> Result<&mut Vec<Value>, Fault> {
        self.frames
            .current_mut()
            .map(|frame| &mut frame.locals)
            .ok_or_else(no_frame)
    }

    fn pool_entry(&self, index: i32) -> Result<&PoolEntry, Fault> {
        let len = self.program.constant_pool.len();
        let slot = slot_index(index, len, "constant")?;
        self.program.constant_pool.get(slot).ok_or_else(|| {
            Fault::new(FaultKind::MemoryAccessOutOfBounds, "constant pool index").with_address(index as i64)
        })
    }

    /// Validates a field access and returns the live object's id.
    fn live_object(&self, target: Value) -> Result<u32, Fault> {
        let id = object_id(target);
        if id == NULL_ID {
            return Err(Fault::new(
                FaultKind::NullReference,
                format!("field access through {target}"),
            ));
        }
        if !self.gc.is_alive(id) || self.heap.get(id).is_none() {
            return Err(Fault::new(
                FaultKind::NullReference,
                format!("object {id} is not alive"),
            )
            .with_address(id as i64));
        }
        Ok(id)
    }

    fn read_field(&self, target: Value, field: i32) -> Result<Value, Fault> {
        let id = self.live_object(target)?;
        let fields = self.heap.get(id).map_or(&[][..], |object| object.fields.as_slice());
        let index = slot_index(field, fields.len(), "field")?;
        Ok(fields[index])
    }

    /// Moves `value` into a field and returns the value it replaced.
    fn write_field(&mut self, target: Value, field: i32, value: Value) -> Result<Value, Fault> {
        let id = self.live_object(target)?;
        let object = self.heap.get_mut(id).ok_or_else(|| {
            Fault::new(FaultKind::NullReference, format!("object {id} is not alive"))
        })?;
        let index = slot_index(field, object.fields.len(), "field")?;
        Ok(std::mem::replace(&mut object.fields[index], value))
    }

    fn render(&self, value: Value) -> String {
        match value {
            Value::Str(index) => match self.program.constant_pool.get(index as usize) {
                Some(PoolEntry::Str(text)) => text.clone(),
                _ => value.to_string(),
            },
            Value::Ref(id) if id != NULL_ID => format!("<struct #{id}>"),
            _ => value.to_string(),
        }
    }

    fn emit(&mut self, line: &str) {
        match &mut self.output {
            OutputSink::Stdout => println!("{line}"),
            OutputSink::Capture(buffer) => {
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
    }

    // ==================== Integer arithmetic ====================

    fn op_iadd(&mut self) -> Result<(), Fault> {
        self.checked_int("+", i32::checked_add)
    }

    fn op_isub(&mut self) -> Result<(), Fault> {
        self.checked_int("-", i32::checked_sub)
    }

    fn op_imul(&mut self) -> Result<(), Fault> {
        self.checked_int("*", i32::checked_mul)
    }

    fn op_idiv(&mut self) -> Result<(), Fault> {
        self.divide("/", i32::checked_div)
    }

    fn op_imod(&mut self) -> Result<(), Fault> {
        self.divide("%", i32::checked_rem)
    }

    fn op_ineg(&mut self) -> Result<(), Fault> {
        let value = self.pop_int()?;
        match value.checked_neg() {
            Some(result) => self.push_int(result),
            None => Err(Fault::new(
                FaultKind::Overflow,
                format!("-({value}) overflows i32"),
            )),
        }
    }

    // ==================== Integer comparison / logic ====================

    fn op_ilt(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l < r)
    }

    fn op_ile(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l <= r)
    }

    fn op_igt(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l > r)
    }

    fn op_ige(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l >= r)
    }

    fn op_ieq(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l == r)
    }

    fn op_ine(&mut self) -> Result<(), Fault> {
        self.compare(|l, r| l != r)
    }

    fn op_inot(&mut self) -> Result<(), Fault> {
        let value = self.pop_int()?;
        self.push_bool(value == 0)
    }

    fn op_iand(&mut self) -> Result<(), Fault> {
        self.int_op(|l, r| l & r)
    }

    fn op_ior(&mut self) -> Result<(), Fault> {
        self.int_op(|l, r| l | r)
    }

    fn op_ixor(&mut self) -> Result<(), Fault> {
        self.int_op(|l, r| l ^ r)
    }

    // ==================== Float arithmetic ====================

    fn op_fadd(&mut self) -> Result<(), Fault> {
        self.float_op(|l, r| l + r)
    }

    fn op_fsub(&mut self) -> Result<(), Fault> {
        self.float_op(|l, r| l - r)
    }

    fn op_fmul(&mut self) -> Result<(), Fault> {
        self.float_op(|l, r| l * r)
    }

    fn op_fdiv(&mut self) -> Result<(), Fault> {
        let right = self.pop_float()?;
        let left = self.pop_float()?;
        if right == 0.0 {
            return Err(Fault::new(
                FaultKind::DivisionByZero,
                format!("{left} / 0.0"),
            ));
        }
        self.push_float(left / right)
    }

    fn op_flt(&mut self) -> Result<(), Fault> {
        self.float_compare(|l, r| l < r)
    }

    fn op_feq(&mut self) -> Result<(), Fault> {
        self.float_compare(|l, r| l == r)
    }

    fn op_itof(&mut self) -> Result<(), Fault> {
        let value = self.pop_int()?;
        self.push_float(value as f32)
    }

    // ==================== Control flow ====================

    fn op_call(&mut self, function: i32) -> Result<(), Fault> {
        let symbol = u32::try_from(function)
            .ok()
            .and_then(|index| self.program.function(index))
            .cloned()
            .ok_or_else(|| {
                Fault::new(
                    FaultKind::InvalidJumpTarget,
                    format!("constant {function} is not a function"),
                )
                .with_address(function as i64)
            })?;
        let target = symbol.address.map_or(-1, |a| a as i32);
        self.jump_target(target)?;
        if self.frames.depth() >= self.config.max_frames {
            return Err(Fault::new(
                FaultKind::StackOverflow,
                format!("call depth exceeds {} frames", self.config.max_frames),
            ));
        }
        let nargs = symbol.nargs as usize;
        if self.stack.len() < nargs {
            return Err(Fault::new(
                FaultKind::StackUnderflow,
                format!(
                    "{}() takes {} arguments but the stack holds {}",
                    symbol.name,
                    nargs,
                    self.stack.len()
                ),
            ));
        }

        // arguments move into the callee's locals without a count change
        let caller_depth = self.stack.len() - nargs;
        let args = self.stack.truncate(caller_depth);
        let target = abi::enter(&mut self.frames, &symbol, args, self.next_pc, caller_depth)?;
        self.stats.record_call(self.frames.depth());
        if self.config.debug {
            debug!(
                "call {}() from {} depth {}",
                symbol.name,
                self.instr_pc,
                self.frames.depth()
            );
        }
        self.pc = target;
        Ok(())
    }

    fn op_ret(&mut self) -> Result<(), Fault> {
        let plan = abi::leave(&mut self.frames)?;
        let result = if plan.has_value(self.stack.len()) {
            Some(self.stack.pop()?)
        } else {
            None
        };

        match plan.return_address {
            ReturnAddress::Halt => {
                if let Some(value) = result {
                    self.push_owned(value)?;
                }
                self.release_all(plan.frame.locals)?;
                self.finish("return from entry frame");
            }
            ReturnAddress::At(address) => {
                let depth = plan.saved_depth.unwrap_or(self.stack.len());
                let dropped = self.stack.truncate(depth);
                self.release_all(dropped)?;
                if let Some(value) = result {
                    self.push_owned(value)?;
                }
                if self.config.debug {
                    debug!("ret from {}() to {}", plan.frame.name(), address);
                }
                self.release_all(plan.frame.locals)?;
                self.pc = address;
            }
        }
        Ok(())
    }

    fn op_br(&mut self, target: i32) -> Result<(), Fault> {
        self.pc = self.jump_target(target)?;
        Ok(())
    }

    fn op_brt(&mut self, target: i32) -> Result<(), Fault> {
        let condition = self.pop_int()?;
        self.branch(condition != 0, target)
    }

    fn op_brf(&mut self, target: i32) -> Result<(), Fault> {
        let condition = self.pop_int()?;
        self.branch(condition == 0, target)
    }

    fn branch(&mut self, taken: bool, target: i32) -> Result<(), Fault> {
        self.stats.record_branch(self.instr_pc, taken);
        self.pc = if taken {
            self.jump_target(target)?
        } else {
            self.next_pc
        };
        Ok(())
    }

    // ==================== Constants ====================

    fn op_cconst(&mut self, value: i32) -> Result<(), Fault> {
        self.push_int(value)
    }

    fn op_iconst(&mut self, value: i32) -> Result<(), Fault> {
        self.push_int(value)
    }

    fn op_fconst(&mut self, constant: i32) -> Result<(), Fault> {
        match self.pool_entry(constant)? {
            PoolEntry::Float(value) => {
                let value = *value;
                self.push_float(value)
            }
            other => Err(Fault::new(
                FaultKind::MemoryAccessOutOfBounds,
                format!("constant {constant} is a {}, not a float", other.kind()),
            )
            .with_address(constant as i64)),
        }
    }

    fn op_sconst(&mut self, constant: i32) -> Result<(), Fault> {
        match self.pool_entry(constant)? {
            PoolEntry::Str(_) => self.push_owned(Value::Str(constant as u32)),
            other => Err(Fault::new(
                FaultKind::MemoryAccessOutOfBounds,
                format!("constant {constant} is a {}, not a string", other.kind()),
            )
            .with_address(constant as i64)),
        }
    }

    // ==================== Memory ====================

    fn op_load(&mut self, slot: i32) -> Result<(), Fault> {
        let locals = self.locals_mut()?;
        let index = slot_index(slot, locals.len(), "local")?;
        let value = locals[index];
        self.push(value)
    }

    fn op_gload(&mut self, slot: i32) -> Result<(), Fault> {
        let index = slot_index(slot, self.globals.len(), "global")?;
        let value = self.globals[index];
        self.push(value)
    }

    fn op_store(&mut self, slot: i32) -> Result<(), Fault> {
        let len = self.locals_mut()?.len();
        let index = slot_index(slot, len, "local")?;
        let value = self.stack.pop()?;
        let old = std::mem::replace(&mut self.locals_mut()?[index], value);
        self.release(old)
    }

    fn op_gstore(&mut self, slot: i32) -> Result<(), Fault> {
        let index = slot_index(slot, self.globals.len(), "global")?;
        let value = self.stack.pop()?;
        let old = std::mem::replace(&mut self.globals[index], value);
        self.release(old)
    }

    fn op_fload(&mut self, field: i32) -> Result<(), Fault> {
        let target = self.stack.pop()?;
        let value = match self.read_field(target, field) {
            Ok(value) => value,
            Err(fault) => {
                self.release(target)?;
                return Err(fault);
            }
        };
        // the field gains its reference before the object can die
        let pushed = self.push(value);
        self.release(target)?;
        pushed
    }

    fn op_fstore(&mut self, field: i32) -> Result<(), Fault> {
        let value = self.stack.pop()?;
        let target = self.stack.pop()?;
        match self.write_field(target, field, value) {
            Ok(old) => {
                self.release(old)?;
                self.release(target)
            }
            Err(fault) => {
                self.release_all(vec![value, target])?;
                Err(fault)
            }
        }
    }

    // ==================== Misc ====================

    fn op_print(&mut self) -> Result<(), Fault> {
        let value = self.stack.pop()?;
        let text = self.render(value);
        self.emit(&text);
        self.release(value)
    }

    fn op_struct(&mut self, fields: i32) -> Result<(), Fault> {
        let nfields = usize::try_from(fields).map_err(|_| {
            Fault::new(
                FaultKind::MemoryAccessOutOfBounds,
                format!("negative field count {fields}"),
            )
            .with_address(fields as i64)
        })?;
        if self.stack.is_full() {
            return Err(self.stack.overflow());
        }
        self.heap.reserve(nfields)?;
        let id = self.gc.allocate();
        self.heap.insert(id, StructValue::new(nfields))?;
        self.push(Value::Ref(id))
    }

    fn op_null(&mut self) -> Result<(), Fault> {
        self.push_owned(Value::NULL)
    }

    fn op_pop(&mut self) -> Result<(), Fault> {
        let value = self.stack.pop()?;
        self.release(value)
    }

    fn op_dup(&mut self) -> Result<(), Fault> {
        let value = self.stack.peek().ok_or_else(|| {
            Fault::new(FaultKind::StackUnderflow, "dup on empty operand stack")
        })?;
        self.push(value)
    }

    fn op_nop(&mut self) -> Result<(), Fault> {
        Ok(())
    }

    fn op_halt(&mut self) -> Result<(), Fault> {
        self.finish("halt");
        Ok(())
    }

    fn op_register_form(&mut self, decoded: Decoded) -> Result<(), Fault> {
        Err(Fault::new(
            FaultKind::InvalidOpcode,
            format!(
                "register-layout instruction {} is not executable",
                decoded.instruction.mnemonic()
            ),
        )
        .with_address(decoded.instruction.opcode() as i64))
    }

    // ==================== Debugger surface ====================

    pub fn set_breakpoint(&mut self, address: usize) -> Result<(), VMError> {
        if !self.loaded {
            return Err(VMError::NoProgram);
        }
        let len = self.program.code.len();
        if address >= len {
            return Err(VMError::InvalidAddress { address, len });
        }
        self.breakpoints.insert(address);
        Ok(())
    }

    /// Returns true if a breakpoint was set at `address`.
    pub fn clear_breakpoint(&mut self, address: usize) -> bool {
        self.breakpoints.remove(&address)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = usize> + '_ {
        self.breakpoints.iter().copied()
    }

    pub fn register_handler(&mut self, handler: Box<dyn FaultHandler>) {
        self.handlers.register(handler);
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerChain {
        &mut self.handlers
    }

    pub fn set_output(&mut self, output: OutputSink) {
        self.output = output;
    }

    /// Captured output so far; empty when printing to stdout.
    pub fn output(&self) -> &str {
        match &self.output {
            OutputSink::Capture(buffer) => buffer,
            OutputSink::Stdout => "",
        }
    }

    /// Drains captured output.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Capture(buffer) => std::mem::take(buffer),
            OutputSink::Stdout => String::new(),
        }
    }

    // ==================== Inspection ====================

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == MachineState::Running
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn program_counter(&self) -> usize {
        self.pc
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.depth()
    }

    /// Operand stack, bottom first.
    pub fn stack(&self) -> &[Value] {
        self.stack.values()
    }

    pub fn top(&self) -> Option<Value> {
        self.stack.peek()
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// Locals of the innermost frame.
    pub fn locals(&self) -> &[Value] {
        self.frames.current().map_or(&[], |frame| frame.locals.as_slice())
    }

    pub fn heap_object(&self, id: u32) -> Option<&StructValue> {
        self.heap.get(id)
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    pub fn is_alive(&self, id: u32) -> bool {
        self.gc.is_alive(id)
    }

    pub fn ref_count(&self, id: u32) -> Option<u32> {
        self.gc.ref_count(id)
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn monitor(&self) -> &FaultMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut FaultMonitor {
        &mut self.monitor
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn last_fault(&self) -> Option<&Fault> {
        self.last_fault.as_ref()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &VMConfig {
        &self.config
    }

    /// Human-readable snapshot of the whole machine.
    pub fn core_dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== core dump ===");
        let _ = writeln!(
            out,
            "state {}  pc {}  steps {}  gc {}",
            self.state.as_str(),
            self.pc,
            self.steps,
            self.gc.name()
        );
        if let Some(fault) = &self.last_fault {
            let _ = writeln!(out, "fault: {fault}");
        }

        let _ = writeln!(out, "--- constant pool ---");
        for (index, entry) in self.program.constant_pool.iter().enumerate() {
            let _ = writeln!(out, "  #{index:<4} {entry}");
        }

        let _ = writeln!(out, "--- globals ---");
        for (slot, value) in self.globals.iter().enumerate() {
            let _ = writeln!(out, "  [{slot}] {value}");
        }

        let _ = writeln!(out, "--- frames (innermost last) ---");
        for frame in self.frames.iter() {
            let ret = match frame.return_address {
                ReturnAddress::Halt => "halt".to_string(),
                ReturnAddress::At(address) => address.to_string(),
            };
            let locals: Vec<String> = frame.locals.iter().map(Value::to_string).collect();
            let _ = writeln!(
                out,
                "  {}() return {} locals [{}]",
                frame.name(),
                ret,
                locals.join(", ")
            );
        }

        let stack: Vec<String> = self.stack.values().iter().map(Value::to_string).collect();
        let _ = writeln!(out, "--- operand stack (top last) ---");
        let _ = writeln!(out, "  [{}]", stack.join(", "));

        let _ = writeln!(
            out,
            "--- heap ({} live, {} slots, {} fields used) ---",
            self.heap.live_count(),
            self.heap.slot_count(),
            self.heap.used_fields()
        );
        for (id, object) in self.heap.objects() {
            let fields: Vec<String> = object.fields.iter().map(Value::to_string).collect();
            let _ = writeln!(
                out,
                "  @{id} slot {} refs {} [{}]",
                self.heap.slot_of(id).unwrap_or_default(),
                self.gc.ref_count(id).unwrap_or_default(),
                fields.join(", ")
            );
        }

        let _ = writeln!(out, "--- code ---");
        out.push_str(&disasm::listing(&self.program, Some(self.instr_pc)));
        out
    }
}
