//! Disassembler and bytecode verifier.
//!
//! Both walk code one decoded instruction at a time. The disassembler never
//! fails: undecodable words are listed as `.word` lines and the walk resumes
//! at the next word. The verifier collects every problem instead of stopping
//! at the first.

use crate::virtual_machine::codec::{
    Decoded, Operands, REGISTER_COUNT, RegisterFields, WORD_SIZE, decode_at, opcode_of,
};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, OperandKind};
use crate::virtual_machine::program::Program;
use crate::virtual_machine::symbols::PoolEntry;
use std::fmt;
use std::fmt::Write;

/// One listing line.
#[derive(Clone, Debug, PartialEq)]
pub struct DisasmLine {
    pub address: usize,
    /// The instruction's words; two for the extended form.
    pub words: Vec<u32>,
    /// `None` for an undecodable word.
    pub instruction: Option<Instruction>,
    /// Operand values in source order (register numbers, immediates).
    pub operands: Vec<i32>,
    /// Rendered operand text, with pool annotations.
    pub text: String,
}

impl fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.instruction.map_or(".word", |i| i.mnemonic());
        let hex: Vec<String> = self.words.iter().map(|w| format!("0x{w:08X}")).collect();
        let body = format!("{:<8} {}", mnemonic, self.text);
        write!(f, "{:04}:  {:<32} ; {}", self.address, body.trim_end(), hex.join(" "))
    }
}

fn register_values(instruction: Instruction, fields: RegisterFields) -> Vec<i32> {
    instruction
        .operand_names()
        .iter()
        .map(|name| match *name {
            "rd" => fields.rd as i32,
            "rs1" => fields.rs1 as i32,
            "rs2" => fields.rs2 as i32,
            _ => fields.imm,
        })
        .collect()
}

fn operand_values(decoded: &Decoded) -> Vec<i32> {
    match decoded.operands {
        Operands::None => Vec::new(),
        Operands::Immediate(value) => vec![value],
        Operands::Registers(fields) => register_values(decoded.instruction, fields),
    }
}

fn pool_text(program: &Program, index: i32) -> String {
    let entry = usize::try_from(index)
        .ok()
        .and_then(|i| program.constant_pool.get(i));
    match entry {
        Some(PoolEntry::Str(text)) => format!("#{index} {text:?}"),
        Some(PoolEntry::Float(value)) => format!("#{index} {value:?}"),
        Some(PoolEntry::Function(function)) => match function.address {
            Some(address) => format!("#{index} {}()@{address}", function.name),
            None => format!("#{index} {}()@?", function.name),
        },
        None => format!("#{index} <missing>"),
    }
}

/// Operand text of one decoded instruction, without address or mnemonic.
fn operand_text(program: &Program, decoded: &Decoded) -> String {
    let values = operand_values(decoded);
    decoded
        .instruction
        .operands()
        .iter()
        .zip(values)
        .map(|(kind, value)| match kind {
            OperandKind::Reg => format!("r{value}"),
            OperandKind::Pool | OperandKind::Func => pool_text(program, value),
            OperandKind::Int | OperandKind::Imm => value.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `mnemonic operands` for trace lines.
pub fn format_decoded(program: &Program, decoded: &Decoded) -> String {
    let text = operand_text(program, decoded);
    if text.is_empty() {
        decoded.instruction.mnemonic().to_string()
    } else {
        format!("{} {}", decoded.instruction.mnemonic(), text)
    }
}

/// Decodes the instruction at `address` into a listing line.
pub fn disassemble_at(program: &Program, address: usize) -> Result<DisasmLine, VMError> {
    let decoded = decode_at(&program.code, address)?;
    Ok(DisasmLine {
        address,
        words: program.code[address..address + decoded.width].to_vec(),
        instruction: Some(decoded.instruction),
        operands: operand_values(&decoded),
        text: operand_text(program, &decoded),
    })
}

/// Lists every instruction in the program.
pub fn disassemble(program: &Program) -> Vec<DisasmLine> {
    let mut lines = Vec::new();
    let mut address = 0;
    while address < program.code.len() {
        match disassemble_at(program, address) {
            Ok(line) => {
                address += line.words.len();
                lines.push(line);
            }
            Err(err) => {
                lines.push(DisasmLine {
                    address,
                    words: vec![program.code[address]],
                    instruction: None,
                    operands: Vec::new(),
                    text: format!("<{err}>"),
                });
                address += 1;
            }
        }
    }
    lines
}

/// Full listing with function headers; `marker` flags one address.
pub fn listing(program: &Program, marker: Option<usize>) -> String {
    let mut out = String::new();
    for line in disassemble(program) {
        if let Some(function) = program.function_at(line.address as u32) {
            let _ = writeln!(
                out,
                "{}:  ; args={} locals={}",
                function.name, function.nargs, function.nlocals
            );
        }
        let flag = if marker == Some(line.address) { "=>" } else { "  " };
        let _ = writeln!(out, "{flag} {line}");
    }
    out
}

// ==================== Verification ====================

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VerifyOptions {
    /// Registers usable by register-layout instructions.
    pub register_count: u8,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            register_count: REGISTER_COUNT,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IssueKind {
    /// Byte length is not a multiple of the word size.
    PartialWord,
    InvalidOpcode,
    /// Extended instruction at the end of the code.
    MissingOperandWord,
    InvalidRegister,
    /// Branch target outside the code.
    InvalidJumpTarget,
    /// Pool operand that is missing or of the wrong kind.
    InvalidConstant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifyIssue {
    /// Word address; for `PartialWord` the byte offset of the remainder.
    pub offset: usize,
    pub kind: IssueKind,
    pub message: String,
}

impl fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}: {}", self.offset, self.message)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerifyReport {
    pub words: usize,
    pub instructions: usize,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    fn push(&mut self, offset: usize, kind: IssueKind, message: String) {
        self.issues.push(VerifyIssue {
            offset,
            kind,
            message,
        });
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} words, {} instructions, {} issues",
            self.words,
            self.instructions,
            self.issues.len()
        )?;
        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

/// Structural checks on raw bytecode.
pub fn verify(bytes: &[u8], options: &VerifyOptions) -> VerifyReport {
    let remainder = bytes.len() % WORD_SIZE;
    let whole = bytes.len() - remainder;
    let code = match Program::from_code_bytes(&bytes[..whole]) {
        Ok(program) => program,
        Err(_) => Program::default(),
    };
    let mut report = walk(&code, options, false);
    if remainder != 0 {
        report.push(
            whole,
            IssueKind::PartialWord,
            format!("{remainder} trailing bytes do not form a word"),
        );
    }
    report
}

/// Structural checks plus branch targets and constant-pool references.
pub fn verify_program(program: &Program, options: &VerifyOptions) -> VerifyReport {
    walk(program, options, true)
}

fn walk(program: &Program, options: &VerifyOptions, check_refs: bool) -> VerifyReport {
    let code = &program.code;
    let mut report = VerifyReport {
        words: code.len(),
        ..Default::default()
    };
    let mut address = 0;
    while address < code.len() {
        let decoded = match decode_at(code, address) {
            Ok(decoded) => decoded,
            Err(VMError::MissingOperandWord { .. }) => {
                report.push(
                    address,
                    IssueKind::MissingOperandWord,
                    "extended instruction has no operand word".to_string(),
                );
                break;
            }
            Err(_) => {
                report.push(
                    address,
                    IssueKind::InvalidOpcode,
                    format!("invalid opcode 0x{:02x}", opcode_of(code[address])),
                );
                address += 1;
                continue;
            }
        };
        report.instructions += 1;
        check_registers(&mut report, address, &decoded, options);
        if check_refs {
            check_references(&mut report, program, address, &decoded);
        }
        address += decoded.width;
    }
    report
}

fn check_registers(report: &mut VerifyReport, address: usize, decoded: &Decoded, options: &VerifyOptions) {
    let Operands::Registers(fields) = decoded.operands else {
        return;
    };
    let instruction = decoded.instruction;
    for (name, kind) in instruction.operand_names().iter().zip(instruction.operands()) {
        if *kind != OperandKind::Reg {
            continue;
        }
        let register = match *name {
            "rd" => fields.rd,
            "rs1" => fields.rs1,
            _ => fields.rs2,
        };
        if register >= options.register_count {
            report.push(
                address,
                IssueKind::InvalidRegister,
                format!(
                    "{} uses r{register} but only {} registers exist",
                    instruction.mnemonic(),
                    options.register_count
                ),
            );
        }
    }
}

fn check_references(report: &mut VerifyReport, program: &Program, address: usize, decoded: &Decoded) {
    let len = program.code.len();
    let value = decoded.immediate();
    let entry = usize::try_from(value)
        .ok()
        .and_then(|i| program.constant_pool.get(i));
    match (decoded.instruction, decoded.instruction.stack_operand()) {
        (Instruction::Br | Instruction::Brt | Instruction::Brf, _) => {
            if usize::try_from(value).map_or(true, |t| t >= len) {
                report.push(
                    address,
                    IssueKind::InvalidJumpTarget,
                    format!("branch to {value} outside 0..{len}"),
                );
            }
        }
        (Instruction::Jf, _) => {
            let target = address as i64 + value as i64;
            if !(0..len as i64).contains(&target) {
                report.push(
                    address,
                    IssueKind::InvalidJumpTarget,
                    format!("relative jump to {target} outside 0..{len}"),
                );
            }
        }
        (_, Some(OperandKind::Func)) => match entry {
            Some(PoolEntry::Function(f)) if f.address.is_some_and(|a| (a as usize) < len) => {}
            _ => report.push(
                address,
                IssueKind::InvalidConstant,
                format!("call through #{value}, which is not a defined function"),
            ),
        },
        (Instruction::Fconst, _) if !matches!(entry, Some(PoolEntry::Float(_))) => report.push(
            address,
            IssueKind::InvalidConstant,
            format!("fconst #{value} is not a float constant"),
        ),
        (Instruction::Sconst, _) if !matches!(entry, Some(PoolEntry::Str(_))) => report.push(
            address,
            IssueKind::InvalidConstant,
            format!("sconst #{value} is not a string constant"),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble_source;
    use crate::virtual_machine::codec::{encode_register, words_to_bytes};

    fn op(instruction: Instruction) -> u32 {
        (instruction.opcode() as u32) << 24
    }

    #[test]
    fn listing_reproduces_mnemonics_and_operands() {
        let source = "iconst 5\niconst -3\niadd\nbr 0\nhalt\n";
        let program = assemble_source(source).unwrap();
        let lines = disassemble(&program);
        let got: Vec<(&str, Vec<i32>)> = lines
            .iter()
            .map(|l| (l.instruction.unwrap().mnemonic(), l.operands.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("iconst", vec![5]),
                ("iconst", vec![-3]),
                ("iadd", vec![]),
                ("br", vec![0]),
                ("halt", vec![]),
            ]
        );
    }

    #[test]
    fn pool_operands_are_annotated() {
        let source = ".def main: args=0, locals=0\n sconst \"hi\"\n fconst 1.5\n call f\n halt\n.def f: args=0, locals=0\n ret\n";
        let program = assemble_source(source).unwrap();
        let lines = disassemble(&program);
        assert_eq!(lines[0].text, "#1 \"hi\"");
        assert_eq!(lines[1].text, "#2 1.5");
        assert_eq!(lines[2].text, "#3 f()@4");
    }

    #[test]
    fn register_operands_use_r_prefix() {
        let program = assemble_source("add r1, r2, r3\nli r4, -7\n").unwrap();
        let lines = disassemble(&program);
        assert_eq!(lines[0].text, "r1, r2, r3");
        assert_eq!(lines[0].operands, vec![1, 2, 3]);
        assert_eq!(lines[1].text, "r4, -7");
    }

    #[test]
    fn extended_form_spans_two_words() {
        let program = assemble_source("iconst 100000000\nhalt\n").unwrap();
        let lines = disassemble(&program);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].words.len(), 2);
        assert_eq!(lines[0].operands, vec![100_000_000]);
        assert_eq!(lines[1].address, 2);
    }

    #[test]
    fn invalid_words_do_not_stop_the_listing() {
        let program = Program {
            code: vec![0xFF00_0000, op(Instruction::Halt)],
            ..Default::default()
        };
        let lines = disassemble(&program);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].instruction.is_none());
        assert!(lines[0].to_string().contains(".word"));
        assert_eq!(lines[1].instruction, Some(Instruction::Halt));
    }

    #[test]
    fn listing_marks_functions_and_current_address() {
        let source = ".def main: args=0, locals=0\n iconst 1\n halt\n";
        let program = assemble_source(source).unwrap();
        let text = listing(&program, Some(1));
        assert!(text.starts_with("main:"));
        assert!(text.contains("=> 0001:"));
    }

    #[test]
    fn verify_clean_bytecode() {
        let bytes = words_to_bytes(&[op(Instruction::Iconst) | 1, op(Instruction::Halt)]);
        let report = verify(&bytes, &VerifyOptions::default());
        assert!(report.is_ok(), "{report}");
        assert_eq!((report.words, report.instructions), (2, 2));
    }

    #[test]
    fn verify_reports_partial_word_and_bad_opcode() {
        let mut bytes = words_to_bytes(&[0xEE00_0000, op(Instruction::Halt)]);
        bytes.extend_from_slice(&[0x29, 0x00]);
        let report = verify(&bytes, &VerifyOptions::default());
        assert_eq!(report.count(IssueKind::InvalidOpcode), 1);
        assert_eq!(report.count(IssueKind::PartialWord), 1);
        assert_eq!(report.issues[1].offset, 8);
        assert_eq!(report.instructions, 1);
    }

    #[test]
    fn verify_reports_missing_operand_word() {
        let extended = (Instruction::Iconst.opcode() as u32 | 0x80) << 24;
        let report = verify(&words_to_bytes(&[extended]), &VerifyOptions::default());
        assert_eq!(report.count(IssueKind::MissingOperandWord), 1);
    }

    #[test]
    fn verify_checks_register_count() {
        let word = encode_register(
            Instruction::Add.opcode(),
            RegisterFields {
                rd: 20,
                rs1: 1,
                rs2: 2,
                imm: 0,
            },
        )
        .unwrap();
        let bytes = words_to_bytes(&[word]);
        assert!(verify(&bytes, &VerifyOptions::default()).is_ok());
        let small = VerifyOptions { register_count: 16 };
        let report = verify(&bytes, &small);
        assert_eq!(report.count(IssueKind::InvalidRegister), 1);
    }

    #[test]
    fn verify_program_checks_targets_and_constants() {
        let program = Program {
            code: vec![
                op(Instruction::Br) | 9,
                op(Instruction::Sconst),
                op(Instruction::Call),
                op(Instruction::Halt),
            ],
            constant_pool: vec![PoolEntry::Float(1.0)],
            ..Default::default()
        };
        let report = verify_program(&program, &VerifyOptions::default());
        assert_eq!(report.count(IssueKind::InvalidJumpTarget), 1);
        assert_eq!(report.count(IssueKind::InvalidConstant), 2);
    }
}
