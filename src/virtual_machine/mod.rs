//! Stack-based bytecode virtual machine for a small C-like language.
//!
//! Programs are sequences of 32-bit big-endian words produced by the
//! [`assembler`] and executed by the [`vm`] engine with reference-counted
//! heap objects, call frames and a recoverable fault model.
//!
//! # Architecture
//!
//! - **Operand stack**: untyped 32-bit slots tagged as int, reference or string
//! - **Frames**: arguments and locals per call, see [`abi`]
//! - **Instruction format**: fixed 32-bit words, with an extended two-word form
//!   for stack operands that do not fit 24 bits, see [`codec`]
//! - **Heap**: struct objects with reference counting, see [`gc`]
//! - **Faults**: categorized runtime errors offered to a handler chain, see
//!   [`exceptions`] and [`monitor`]
//!
//! # Modules
//!
//! - [`abi`]: Call frames, calling conventions and frame layout
//! - [`assembler`]: Assembly parsing, diagnostics, and bytecode generation
//! - [`codec`]: Word encoding and decoding
//! - [`config`]: Machine limits and switches
//! - [`disasm`]: Disassembler and bytecode verifier
//! - [`errors`]: Load, assembly and runtime error types
//! - [`exceptions`]: Fault handlers
//! - [`gc`]: Heap object lifecycle
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`monitor`]: Fault statistics and pattern detection
//! - [`program`]: Program artifact format
//! - [`symbols`]: Function, label and constant-pool symbols
//! - [`vm`]: Execution engine

pub mod abi;
pub mod assembler;
pub mod codec;
pub mod config;
pub mod disasm;
pub mod errors;
pub mod exceptions;
pub mod gc;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod monitor;
pub mod program;
pub mod symbols;
pub mod vm;
