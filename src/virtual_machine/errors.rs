use crate::types::encoding::DecodeError;
use stackvm_derive::Error;
use std::fmt;

/// Errors that can occur during loading, assembly or execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VMError {
    /// Unknown opcode encountered in bytecode.
    #[error("invalid instruction 0x{opcode:02x} at word {offset}")]
    InvalidInstruction { opcode: u8, offset: usize },
    /// Unrecognized instruction mnemonic during assembly.
    #[error("invalid instruction name: {name}")]
    InvalidInstructionName { name: String },
    /// Wrong number of operands for an instruction.
    #[error("instruction {instruction} expects {expected} operands but got {actual}")]
    ArityMismatch {
        instruction: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Operand kind does not match what the instruction expects.
    #[error(
        "instruction {instruction} expected argument {arg_index} to be {expected} but got {actual}"
    )]
    InvalidOperand {
        instruction: &'static str,
        arg_index: usize,
        expected: &'static str,
        actual: String,
    },
    /// Register number outside the register file.
    #[error("invalid register {register}")]
    InvalidRegister { register: i64 },
    /// Immediate does not fit the signed field width.
    #[error("immediate {value} does not fit in {bits} signed bits")]
    ImmediateOutOfRange { value: i64, bits: u32 },
    /// Bytecode length is not a multiple of the word size.
    #[error("bytecode length {len} is not a multiple of 4")]
    PartialWord { len: usize },
    /// Extended instruction at the end of the code with no operand word.
    #[error("extended instruction at word {offset} is missing its operand word")]
    MissingOperandWord { offset: usize },
    #[error("empty program")]
    EmptyProgram,
    /// Program exceeds the configured instruction cache.
    #[error("program of {words} words exceeds the instruction cache of {limit} words")]
    ProgramTooLarge { words: usize, limit: usize },
    /// Assembly error with line and column context.
    #[error("line {line}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
    /// Symbol defined twice in one assembly unit.
    #[error("redefinition of symbol {name}")]
    SymbolRedefinition { name: String },
    /// Label referenced but never defined.
    #[error("undefined label: {name}")]
    UndefinedLabel { name: String },
    /// Function referenced but never defined.
    #[error("undefined function: {name}")]
    UndefinedFunction { name: String },
    /// File I/O error.
    #[error("io error: {message}")]
    IoError { message: String },
    /// Failed to decode a program artifact.
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },
    /// Configuration rejected by [`VMConfig::validate`](super::config::VMConfig::validate).
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    /// Operation not permitted in the current machine state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("no program loaded")]
    NoProgram,
    /// Code address outside the loaded program.
    #[error("address {address} is outside the program ({len} words)")]
    InvalidAddress { address: usize, len: usize },
    /// The controller worker has shut down.
    #[error("controller is closed")]
    ControllerClosed,
    /// Unrecovered runtime fault.
    #[error("{0}")]
    Fault(Fault),
}

impl From<std::io::Error> for VMError {
    fn from(err: std::io::Error) -> Self {
        VMError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<DecodeError> for VMError {
    fn from(err: DecodeError) -> Self {
        VMError::DecodeError {
            reason: err.to_string(),
        }
    }
}

impl From<Fault> for VMError {
    fn from(fault: Fault) -> Self {
        VMError::Fault(fault)
    }
}

/// Runtime fault categories.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FaultKind {
    DivisionByZero = 0,
    InvalidOpcode = 1,
    InvalidRegister = 2,
    MemoryAccessOutOfBounds = 3,
    NullReference = 4,
    StackOverflow = 5,
    StackUnderflow = 6,
    InvalidJumpTarget = 7,
    StepLimitExceeded = 8,
    Overflow = 9,
}

impl FaultKind {
    pub const COUNT: usize = 10;

    pub const ALL: [FaultKind; FaultKind::COUNT] = [
        FaultKind::DivisionByZero,
        FaultKind::InvalidOpcode,
        FaultKind::InvalidRegister,
        FaultKind::MemoryAccessOutOfBounds,
        FaultKind::NullReference,
        FaultKind::StackOverflow,
        FaultKind::StackUnderflow,
        FaultKind::InvalidJumpTarget,
        FaultKind::StepLimitExceeded,
        FaultKind::Overflow,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            FaultKind::DivisionByZero => "division by zero",
            FaultKind::InvalidOpcode => "invalid opcode",
            FaultKind::InvalidRegister => "invalid register",
            FaultKind::MemoryAccessOutOfBounds => "memory access out of bounds",
            FaultKind::NullReference => "null reference",
            FaultKind::StackOverflow => "stack overflow",
            FaultKind::StackUnderflow => "stack underflow",
            FaultKind::InvalidJumpTarget => "invalid jump target",
            FaultKind::StepLimitExceeded => "step limit exceeded",
            FaultKind::Overflow => "arithmetic overflow",
        }
    }

    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime fault raised by the execution engine.
///
/// Carries the faulting instruction's address and mnemonic so handlers and
/// the monitor can correlate repeated failures.
#[derive(Clone, Debug, PartialEq, Error)]
#[error(
    "{kind} at pc {pc} ({instruction}){}{}",
    self.address.map(|address| format!(" address {address}")).unwrap_or_default(),
    if self.detail.is_empty() { String::new() } else { format!(": {}", self.detail) }
)]
pub struct Fault {
    pub kind: FaultKind,
    /// Word index of the faulting instruction.
    pub pc: usize,
    /// Mnemonic of the faulting instruction, or `"?"` if it could not be decoded.
    pub instruction: &'static str,
    /// Offending address, slot or target when one applies.
    pub address: Option<i64>,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            pc: 0,
            instruction: "?",
            address: None,
            detail: detail.into(),
        }
    }

    pub fn with_address(mut self, address: i64) -> Self {
        self.address = Some(address);
        self
    }

    /// Stamps the fault with the location of the instruction that raised it.
    pub fn at(mut self, pc: usize, instruction: &'static str) -> Self {
        self.pc = pc;
        self.instruction = instruction;
        self
    }
}
