//! Stack-based bytecode virtual machine.
//!
//! Provides the instruction set, assembler, execution engine with reference
//! counting, fault handling, a disassembler and an async debugger controller.

pub mod controller;
pub mod types;
pub mod utils;
pub mod virtual_machine;
