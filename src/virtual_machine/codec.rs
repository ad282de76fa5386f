//! Instruction word encoding and decoding.
//!
//! Every instruction occupies one big-endian 32-bit word, optionally
//! followed by a second operand word when the extended flag (`0x80`) is set
//! on the opcode byte.
//!
//! ```text
//! stack:    [31..24 opcode][23..0 operand, signed]
//! register: [31..24 opcode][23..19 rd][18..14 rs1][13..9 rs2][8..0 imm, signed]
//! extended: [31..24 opcode|0x80][23..0 unused] [31..0 operand word]
//! ```
//!
//! Encoding and decoding are pure functions of their inputs.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, Layout};

pub const WORD_SIZE: usize = 4;

pub const OPCODE_SHIFT: u32 = 24;
pub const OPCODE_MASK: u32 = 0xFF00_0000;
pub const STACK_OPERAND_MASK: u32 = 0x00FF_FFFF;
pub const STACK_OPERAND_BITS: u32 = 24;

pub const RD_SHIFT: u32 = 19;
pub const RS1_SHIFT: u32 = 14;
pub const RS2_SHIFT: u32 = 9;
pub const RD_MASK: u32 = 0x00F8_0000;
pub const RS1_MASK: u32 = 0x0007_C000;
pub const RS2_MASK: u32 = 0x0000_3E00;
pub const IMM_MASK: u32 = 0x0000_01FF;
pub const IMM_BITS: u32 = 9;

pub const REGISTER_COUNT: u8 = 32;
pub const EXTENDED_FLAG: u8 = 0x80;

/// Sign-extends the low `bits` bits of `value`.
pub const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Returns true if `value` is representable in `bits` two's-complement bits.
pub const fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    value >= min && value <= max
}

pub const fn is_valid_register(register: i64) -> bool {
    register >= 0 && register < REGISTER_COUNT as i64
}

pub const fn is_extended(opcode: u8) -> bool {
    opcode & EXTENDED_FLAG != 0
}

pub const fn base_opcode(opcode: u8) -> u8 {
    opcode & !EXTENDED_FLAG
}

/// Returns true if `opcode` names an instruction, allowing the extended flag
/// only on stack-layout instructions that take an operand.
pub fn is_valid_opcode(opcode: u8) -> bool {
    match Instruction::try_from(base_opcode(opcode)) {
        Ok(instr) if is_extended(opcode) => instr.stack_operand().is_some(),
        Ok(_) => true,
        Err(_) => false,
    }
}

pub const fn opcode_of(word: u32) -> u8 {
    (word >> OPCODE_SHIFT) as u8
}

/// Encodes a stack-layout word; the operand must fit in 24 signed bits.
pub fn encode_stack(opcode: u8, operand: i32) -> Result<u32, VMError> {
    if !fits_signed(operand as i64, STACK_OPERAND_BITS) {
        return Err(VMError::ImmediateOutOfRange {
            value: operand as i64,
            bits: STACK_OPERAND_BITS,
        });
    }
    Ok(((opcode as u32) << OPCODE_SHIFT) | (operand as u32 & STACK_OPERAND_MASK))
}

/// Encodes a stack instruction in the shortest form that holds `operand`.
pub fn encode_stack_auto(opcode: u8, operand: i32) -> Vec<u32> {
    match encode_stack(opcode, operand) {
        Ok(word) => vec![word],
        Err(_) => vec![((opcode | EXTENDED_FLAG) as u32) << OPCODE_SHIFT, operand as u32],
    }
}

pub const fn decode_stack_operand(word: u32) -> i32 {
    sign_extend(word & STACK_OPERAND_MASK, STACK_OPERAND_BITS)
}

/// Register-layout operand fields.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterFields {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

pub fn encode_register(opcode: u8, fields: RegisterFields) -> Result<u32, VMError> {
    for register in [fields.rd, fields.rs1, fields.rs2] {
        if !is_valid_register(register as i64) {
            return Err(VMError::InvalidRegister {
                register: register as i64,
            });
        }
    }
    if !fits_signed(fields.imm as i64, IMM_BITS) {
        return Err(VMError::ImmediateOutOfRange {
            value: fields.imm as i64,
            bits: IMM_BITS,
        });
    }
    Ok(((opcode as u32) << OPCODE_SHIFT)
        | ((fields.rd as u32) << RD_SHIFT)
        | ((fields.rs1 as u32) << RS1_SHIFT)
        | ((fields.rs2 as u32) << RS2_SHIFT)
        | (fields.imm as u32 & IMM_MASK))
}

pub const fn decode_register(word: u32) -> RegisterFields {
    RegisterFields {
        rd: ((word & RD_MASK) >> RD_SHIFT) as u8,
        rs1: ((word & RS1_MASK) >> RS1_SHIFT) as u8,
        rs2: ((word & RS2_MASK) >> RS2_SHIFT) as u8,
        imm: sign_extend(word & IMM_MASK, IMM_BITS),
    }
}

/// Decoded operand payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operands {
    None,
    Immediate(i32),
    Registers(RegisterFields),
}

/// One decoded instruction and the number of words it spans.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decoded {
    pub instruction: Instruction,
    pub operands: Operands,
    pub extended: bool,
    /// 1, or 2 for the extended form.
    pub width: usize,
}

impl Decoded {
    /// The stack operand, or 0 when the instruction carries none.
    pub fn immediate(&self) -> i32 {
        match self.operands {
            Operands::Immediate(v) => v,
            _ => 0,
        }
    }
}

/// Decodes the instruction starting at word `pc`.
pub fn decode_at(code: &[u32], pc: usize) -> Result<Decoded, VMError> {
    let word = *code.get(pc).ok_or(VMError::MissingOperandWord { offset: pc })?;
    let opcode = opcode_of(word);
    let invalid = VMError::InvalidInstruction { opcode, offset: pc };
    if !is_valid_opcode(opcode) {
        return Err(invalid);
    }
    let instruction = Instruction::try_from(base_opcode(opcode)).map_err(|_| invalid)?;

    if is_extended(opcode) {
        let operand = *code
            .get(pc + 1)
            .ok_or(VMError::MissingOperandWord { offset: pc })?;
        return Ok(Decoded {
            instruction,
            operands: Operands::Immediate(operand as i32),
            extended: true,
            width: 2,
        });
    }

    let operands = match instruction.layout() {
        Layout::Register => Operands::Registers(decode_register(word)),
        Layout::Stack if instruction.stack_operand().is_some() => {
            Operands::Immediate(decode_stack_operand(word))
        }
        Layout::Stack => Operands::None,
    };
    Ok(Decoded {
        instruction,
        operands,
        extended: false,
        width: 1,
    })
}

/// Splits raw bytecode into big-endian words.
pub fn bytes_to_words(bytes: &[u8]) -> Result<Vec<u32>, VMError> {
    if bytes.len() % WORD_SIZE != 0 {
        return Err(VMError::PartialWord { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(WORD_SIZE)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extend_9_bit_boundaries() {
        assert_eq!(sign_extend(0x0FF, 9), 255);
        assert_eq!(sign_extend(0x100, 9), -256);
        assert_eq!(sign_extend(0x1FF, 9), -1);
        // Matches the explicit OR with 0xFFFFFE00.
        assert_eq!(sign_extend(0x180, 9) as u32, 0x180 | 0xFFFF_FE00);
    }

    #[test]
    fn sign_extend_16_bit_boundaries() {
        assert_eq!(sign_extend(0x7FFF, 16), 32767);
        assert_eq!(sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn fits_signed_limits() {
        assert!(fits_signed(255, 9));
        assert!(fits_signed(-256, 9));
        assert!(!fits_signed(256, 9));
        assert!(!fits_signed(-257, 9));
        assert!(fits_signed(8_388_607, 24));
        assert!(!fits_signed(8_388_608, 24));
    }

    #[test]
    fn stack_word_layout() {
        let word = encode_stack(Instruction::Iconst.opcode(), 5).unwrap();
        assert_eq!(word, 0x1C00_0005);
        let word = encode_stack(Instruction::Iconst.opcode(), -1).unwrap();
        assert_eq!(word, 0x1CFF_FFFF);
        assert_eq!(decode_stack_operand(word), -1);
    }

    #[test]
    fn stack_operand_range_is_checked() {
        assert!(matches!(
            encode_stack(Instruction::Iconst.opcode(), 1 << 23),
            Err(VMError::ImmediateOutOfRange { bits: 24, .. })
        ));
    }

    #[test]
    fn auto_encoding_extends_large_operands() {
        let op = Instruction::Iconst.opcode();
        assert_eq!(encode_stack_auto(op, 7).len(), 1);
        let words = encode_stack_auto(op, 100_000_000);
        assert_eq!(words, vec![0x9C00_0000, 100_000_000]);
        let decoded = decode_at(&words, 0).unwrap();
        assert!(decoded.extended);
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.immediate(), 100_000_000);
    }

    #[test]
    fn every_instruction_decodes_at_operand_limits() {
        let stack_min = -(1i32 << 23);
        let stack_max = (1i32 << 23) - 1;
        for instr in Instruction::ALL {
            let op = instr.opcode();
            match (instr.layout(), instr.stack_operand()) {
                (Layout::Stack, Some(_)) => {
                    for value in [stack_min, -1, 0, stack_max] {
                        let word = encode_stack(op, value).unwrap();
                        let decoded = decode_at(&[word], 0).unwrap();
                        assert_eq!(decoded.instruction, *instr);
                        assert_eq!((decoded.immediate(), decoded.width), (value, 1));
                    }
                    for value in [i32::MIN, stack_min - 1, stack_max + 1, i32::MAX] {
                        let words = encode_stack_auto(op, value);
                        assert_eq!(words.len(), 2, "{}", instr.mnemonic());
                        let decoded = decode_at(&words, 0).unwrap();
                        assert!(decoded.extended);
                        assert_eq!(decoded.instruction, *instr);
                        assert_eq!(decoded.immediate(), value);
                    }
                }
                (Layout::Stack, None) => {
                    let decoded = decode_at(&[(op as u32) << OPCODE_SHIFT], 0).unwrap();
                    assert_eq!(decoded.instruction, *instr);
                    assert_eq!(decoded.operands, Operands::None);
                    assert!(!is_valid_opcode(op | EXTENDED_FLAG), "{}", instr.mnemonic());
                }
                (Layout::Register, _) => {
                    let limits = [
                        RegisterFields {
                            rd: 0,
                            rs1: 0,
                            rs2: 0,
                            imm: -256,
                        },
                        RegisterFields {
                            rd: 31,
                            rs1: 31,
                            rs2: 31,
                            imm: 255,
                        },
                    ];
                    for fields in limits {
                        let word = encode_register(op, fields).unwrap();
                        let decoded = decode_at(&[word], 0).unwrap();
                        assert_eq!(decoded.instruction, *instr);
                        assert_eq!(decoded.operands, Operands::Registers(fields));
                    }
                }
            }
        }
    }

    #[test]
    fn register_fields_roundtrip() {
        let fields = RegisterFields {
            rd: 31,
            rs1: 7,
            rs2: 1,
            imm: -256,
        };
        let word = encode_register(Instruction::Lw.opcode(), fields).unwrap();
        assert_eq!(opcode_of(word), 0x62);
        assert_eq!(decode_register(word), fields);
    }

    #[test]
    fn register_masks_are_disjoint() {
        let word = encode_register(
            Instruction::Add.opcode(),
            RegisterFields {
                rd: 1,
                rs1: 0,
                rs2: 0,
                imm: 0,
            },
        )
        .unwrap();
        assert_eq!(word & RD_MASK, 1 << RD_SHIFT);
        assert_eq!(word & (RS1_MASK | RS2_MASK | IMM_MASK), 0);
    }

    #[test]
    fn register_encoding_rejects_bad_fields() {
        let op = Instruction::Add.opcode();
        assert!(matches!(
            encode_register(op, RegisterFields { rd: 32, ..Default::default() }),
            Err(VMError::InvalidRegister { register: 32 })
        ));
        assert!(matches!(
            encode_register(op, RegisterFields { imm: 256, ..Default::default() }),
            Err(VMError::ImmediateOutOfRange { bits: 9, .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_and_bad_extended() {
        assert!(matches!(
            decode_at(&[0xFF00_0000], 0),
            Err(VMError::InvalidInstruction { opcode: 0xFF, offset: 0 })
        ));
        // halt takes no operand, so its extended form is invalid
        assert!(!is_valid_opcode(Instruction::Halt.opcode() | EXTENDED_FLAG));
        assert!(matches!(
            decode_at(&[0x9C00_0000], 0),
            Err(VMError::MissingOperandWord { offset: 0 })
        ));
    }

    #[test]
    fn byte_conversion_is_big_endian() {
        let bytes = words_to_bytes(&[0x1C00_0005, 0x2900_0000]);
        assert_eq!(bytes, vec![0x1C, 0, 0, 5, 0x29, 0, 0, 0]);
        assert_eq!(bytes_to_words(&bytes).unwrap(), vec![0x1C00_0005, 0x2900_0000]);
        assert!(matches!(
            bytes_to_words(&bytes[..5]),
            Err(VMError::PartialWord { len: 5 })
        ));
    }
}
