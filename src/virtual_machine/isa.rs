//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical instruction table and invokes a callback macro for code
//! generation, so the codec, assembler, disassembler and ISA drift check all
//! read the same definitions.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - Per-instruction metadata: mnemonic, [`Layout`], operand kinds, control flow
//!
//! # Instruction Format
//!
//! Every instruction is one 32-bit big-endian word (see [`codec`](super::codec)):
//! - Stack layout: `opcode(8) | operand(24, signed)`
//! - Register layout: `opcode(8) | rd(5) | rs1(5) | rs2(5) | imm(9, signed)`
//! - Extended stack form: `opcode | 0x80` followed by a full 32-bit operand word

use crate::virtual_machine::errors::VMError;

/// Invokes a callback macro with the complete instruction definition list.
///
/// Entry format: `Name = opcode, "mnemonic" => Layout [field: Kind, ...], Flow`.
/// `Flow` is `Jump` for instructions that write the program counter themselves.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Integer arithmetic
            // =========================
            /// iadd ; push(left + right), overflow faults
            Iadd = 0x01, "iadd" => Stack [], Seq,
            /// isub ; push(left - right), overflow faults
            Isub = 0x02, "isub" => Stack [], Seq,
            /// imul ; push(left * right), overflow faults
            Imul = 0x03, "imul" => Stack [], Seq,
            /// idiv ; push(left / right), division by zero faults
            Idiv = 0x04, "idiv" => Stack [], Seq,
            // =========================
            // Integer comparison / logic
            // =========================
            /// ilt ; push(left < right)
            Ilt = 0x05, "ilt" => Stack [], Seq,
            /// ile ; push(left <= right)
            Ile = 0x06, "ile" => Stack [], Seq,
            /// igt ; push(left > right)
            Igt = 0x07, "igt" => Stack [], Seq,
            /// ige ; push(left >= right)
            Ige = 0x08, "ige" => Stack [], Seq,
            /// ieq ; push(left == right)
            Ieq = 0x09, "ieq" => Stack [], Seq,
            /// ine ; push(left != right)
            Ine = 0x0A, "ine" => Stack [], Seq,
            /// ineg ; push(-value), overflow faults
            Ineg = 0x0B, "ineg" => Stack [], Seq,
            /// inot ; push(value == 0)
            Inot = 0x0C, "inot" => Stack [], Seq,
            /// iand ; push(left & right)
            Iand = 0x0D, "iand" => Stack [], Seq,
            /// ior ; push(left | right)
            Ior = 0x0E, "ior" => Stack [], Seq,
            /// ixor ; push(left ^ right)
            Ixor = 0x0F, "ixor" => Stack [], Seq,
            // =========================
            // Float arithmetic (raw bits on the stack)
            // =========================
            /// fadd ; push(left + right)
            Fadd = 0x10, "fadd" => Stack [], Seq,
            /// fsub ; push(left - right)
            Fsub = 0x11, "fsub" => Stack [], Seq,
            /// fmul ; push(left * right)
            Fmul = 0x12, "fmul" => Stack [], Seq,
            /// flt ; push(left < right)
            Flt = 0x13, "flt" => Stack [], Seq,
            /// feq ; push(left == right)
            Feq = 0x14, "feq" => Stack [], Seq,
            /// itof ; push(value as f32)
            Itof = 0x15, "itof" => Stack [], Seq,
            // =========================
            // Control flow
            // =========================
            /// call fn ; push frame, move nargs arguments into locals, jump
            Call = 0x16, "call" => Stack [function: Func], Jump,
            /// ret ; pop frame, restore depth, re-push return value
            Ret = 0x17, "ret" => Stack [], Jump,
            /// br target ; pc = target
            Br = 0x18, "br" => Stack [target: Int], Jump,
            /// brt target ; if pop() != 0 then pc = target
            Brt = 0x19, "brt" => Stack [target: Int], Jump,
            /// brf target ; if pop() == 0 then pc = target
            Brf = 0x1A, "brf" => Stack [target: Int], Jump,
            // =========================
            // Constants
            // =========================
            /// cconst c ; push(char code)
            Cconst = 0x1B, "cconst" => Stack [value: Int], Seq,
            /// iconst n ; push(n)
            Iconst = 0x1C, "iconst" => Stack [value: Int], Seq,
            /// fconst #i ; push(pool[i] float bits)
            Fconst = 0x1D, "fconst" => Stack [constant: Pool], Seq,
            /// sconst #i ; push(pool[i] string)
            Sconst = 0x1E, "sconst" => Stack [constant: Pool], Seq,
            // =========================
            // Memory
            // =========================
            /// load i ; push(locals[i])
            Load = 0x1F, "load" => Stack [slot: Int], Seq,
            /// gload i ; push(globals[i])
            Gload = 0x20, "gload" => Stack [slot: Int], Seq,
            /// fload i ; push(pop().fields[i])
            Fload = 0x21, "fload" => Stack [field: Int], Seq,
            /// store i ; locals[i] = pop()
            Store = 0x22, "store" => Stack [slot: Int], Seq,
            /// gstore i ; globals[i] = pop()
            Gstore = 0x23, "gstore" => Stack [slot: Int], Seq,
            /// fstore i ; value = pop(); pop().fields[i] = value
            Fstore = 0x24, "fstore" => Stack [field: Int], Seq,
            // =========================
            // Misc
            // =========================
            /// print ; write pop() to the output sink
            Print = 0x25, "print" => Stack [], Seq,
            /// struct n ; push(new struct with n zeroed fields)
            Struct = 0x26, "struct" => Stack [fields: Int], Seq,
            /// null ; push(null reference)
            Null = 0x27, "null" => Stack [], Seq,
            /// pop ; discard top of stack
            Pop = 0x28, "pop" => Stack [], Seq,
            /// halt ; stop the machine
            Halt = 0x29, "halt" => Stack [], Seq,
            /// imod ; push(left % right), division by zero faults
            Imod = 0x2A, "imod" => Stack [], Seq,
            /// fdiv ; push(left / right), division by zero faults
            Fdiv = 0x2B, "fdiv" => Stack [], Seq,
            /// dup ; push(peek())
            Dup = 0x2C, "dup" => Stack [], Seq,
            /// nop ; no operation
            Nop = 0x2D, "nop" => Stack [], Seq,
            // =========================
            // Register layout (codec and tooling only)
            // =========================
            /// mov rd, rs1 ; rd = rs1
            Mov = 0x60, "mov" => Register [rd: Reg, rs1: Reg], Seq,
            /// li rd, imm ; rd = imm
            Li = 0x61, "li" => Register [rd: Reg, imm: Imm], Seq,
            /// lw rd, rs1, imm ; rd = mem[rs1 + imm]
            Lw = 0x62, "lw" => Register [rd: Reg, rs1: Reg, imm: Imm], Seq,
            /// sw rs2, rd, imm ; mem[rd + imm] = rs2
            Sw = 0x63, "sw" => Register [rs2: Reg, rd: Reg, imm: Imm], Seq,
            /// add rd, rs1, rs2 ; rd = rs1 + rs2
            Add = 0x64, "add" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// sub rd, rs1, rs2 ; rd = rs1 - rs2
            Sub = 0x65, "sub" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// mul rd, rs1, rs2 ; rd = rs1 * rs2
            Mul = 0x66, "mul" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// div rd, rs1, rs2 ; rd = rs1 / rs2
            Div = 0x67, "div" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// slt rd, rs1, rs2 ; rd = rs1 < rs2
            Slt = 0x68, "slt" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// sle rd, rs1, rs2 ; rd = rs1 <= rs2
            Sle = 0x69, "sle" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// sgt rd, rs1, rs2 ; rd = rs1 > rs2
            Sgt = 0x6A, "sgt" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// sge rd, rs1, rs2 ; rd = rs1 >= rs2
            Sge = 0x6B, "sge" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// seq rd, rs1, rs2 ; rd = rs1 == rs2
            Seq = 0x6C, "seq" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// sne rd, rs1, rs2 ; rd = rs1 != rs2
            Sne = 0x6D, "sne" => Register [rd: Reg, rs1: Reg, rs2: Reg], Seq,
            /// jf rs1, imm ; if rs1 == 0 then pc += imm
            Jf = 0x6E, "jf" => Register [rs1: Reg, imm: Imm], Jump,
        }
    };
}

/// Word layout of an instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// `opcode(8) | operand(24)`, optionally extended by a second word.
    Stack,
    /// `opcode(8) | rd(5) | rs1(5) | rs2(5) | imm(9)`.
    Register,
}

/// Operand kinds accepted by instructions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Signed integer: literal, character, global slot or code address.
    Int,
    /// Constant-pool index of a string or float literal.
    Pool,
    /// Constant-pool index of a function symbol.
    Func,
    /// Register number `0..32`.
    Reg,
    /// 9-bit signed immediate of the register layout.
    Imm,
}

impl OperandKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperandKind::Int => "INT",
            OperandKind::Pool => "POOL",
            OperandKind::Func => "FUNC",
            OperandKind::Reg => "REG",
            OperandKind::Imm => "IMM",
        }
    }
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => $layout:ident [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $flow:ident
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Every instruction in opcode-table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks up an instruction by its assembly mnemonic.
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }

            pub const fn layout(&self) -> Layout {
                match self {
                    $( Instruction::$name => Layout::$layout, )*
                }
            }

            /// Operand kinds in source order.
            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }

            /// Operand field names in source order (`rd`, `rs1`, `target`, ...).
            pub const fn operand_names(&self) -> &'static [&'static str] {
                match self {
                    $( Instruction::$name => &[ $( stringify!($field) ),* ], )*
                }
            }

            /// True if the instruction writes the program counter itself.
            pub const fn is_control_transfer(&self) -> bool {
                match self {
                    $( Instruction::$name => define_instructions!(@flow $flow), )*
                }
            }

            pub const fn opcode(&self) -> u8 {
                *self as u8
            }
        }
    };

    (@flow Seq) => { false };
    (@flow Jump) => { true };
}

for_each_instruction!(define_instructions);

impl Instruction {
    /// Single stack operand kind, if any.
    pub fn stack_operand(&self) -> Option<OperandKind> {
        match (self.layout(), self.operands()) {
            (Layout::Stack, [kind]) => Some(*kind),
            _ => None,
        }
    }
}
