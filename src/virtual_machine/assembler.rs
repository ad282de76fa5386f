//! Assembler: event-driven code generation plus a text front end.
//!
//! [`Assembler`] receives a stream of events (`emit`, `define_label`,
//! `define_function`, `define_global`) from a parser or compiler and builds
//! a linked [`Program`]. Labels may be referenced before they are defined;
//! each such use records a patch site that is filled in when the label is
//! defined. Any label or function still undefined at [`Assembler::finish`]
//! is an error.
//!
//! # Syntax
//!
//! ```text
//! .globals 2                      # reserve two anonymous global slots
//! .global counter                 # named global, slot 2
//! .def main: args=0, locals=1     # function entry point and frame shape
//!     iconst 10
//!     store 0
//! loop:
//!     load 0
//!     brf done
//!     ...
//!     br loop
//! done:
//!     sconst "done\n"
//!     print
//!     halt
//! ```
//!
//! - Mnemonics are case-insensitive; `push` is an alias for `iconst`
//! - Registers use the `r` prefix (`r0`..`r31`)
//! - Character literals are single-quoted (`'a'`, `'\n'`)
//! - String literals are double-quoted; float literals contain a `.`
//! - Comments start with `#` or `;`; commas between operands are optional

use crate::error;
use crate::virtual_machine::codec::{
    OPCODE_SHIFT, RegisterFields, encode_register, encode_stack, encode_stack_auto, opcode_of,
};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, Layout, OperandKind};
use crate::virtual_machine::program::Program;
use crate::virtual_machine::symbols::{ConstantPool, FunctionSymbol, LabelSymbol, PoolEntry};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHARS: [char; 2] = ['#', ';'];
const LABEL_SUFFIX: char = ':';
const INITIAL_CODE_WORDS: usize = 2048;
const PUSH_ALIAS: &str = "push";

/// One operand supplied to [`Assembler::emit`].
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Int(i32),
    Char(char),
    Reg(u8),
    /// Global name or code label.
    Ident(String),
    /// Function name, resolved through the constant pool.
    Func(String),
    Str(String),
    Float(f32),
}

impl Operand {
    fn describe(&self) -> String {
        match self {
            Operand::Int(v) => format!("integer {v}"),
            Operand::Char(c) => format!("character {c:?}"),
            Operand::Reg(r) => format!("register r{r}"),
            Operand::Ident(name) => format!("identifier {name}"),
            Operand::Func(name) => format!("function {name}"),
            Operand::Str(s) => format!("string {s:?}"),
            Operand::Float(v) => format!("float {v}"),
        }
    }
}

/// Event-driven assembler producing a linked [`Program`].
pub struct Assembler {
    code: Vec<u32>,
    pool: ConstantPool,
    labels: HashMap<String, LabelSymbol>,
    globals: Vec<(String, u32)>,
    data_size: u32,
    main: Option<u32>,
}

impl Assembler {
    /// Creates an assembler that reserves `data_size` anonymous global slots.
    pub fn new(data_size: u32) -> Self {
        Self {
            code: Vec::with_capacity(INITIAL_CODE_WORDS),
            pool: ConstantPool::new(),
            labels: HashMap::new(),
            globals: Vec::new(),
            data_size,
            main: None,
        }
    }

    /// Word index of the next instruction.
    pub fn ip(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn label_address(&self, name: &str) -> Option<u32> {
        self.labels.get(name).and_then(|l| l.address)
    }

    pub fn global_slot(&self, name: &str) -> Option<u32> {
        self.globals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| *slot)
    }

    /// Changes the reserved data area; only allowed before any named global.
    pub fn set_data_size(&mut self, data_size: u32) -> Result<(), VMError> {
        if !self.globals.is_empty() {
            return Err(VMError::InvalidOperand {
                instruction: ".globals",
                arg_index: 0,
                expected: "directive before any .global",
                actual: data_size.to_string(),
            });
        }
        self.data_size = data_size;
        Ok(())
    }

    /// Doubles the code buffer until `words` more fit.
    fn ensure_capacity(&mut self, words: usize) {
        let needed = self.code.len() + words;
        if needed > self.code.capacity() {
            let mut capacity = self.code.capacity().max(INITIAL_CODE_WORDS);
            while capacity < needed {
                capacity *= 2;
            }
            self.code.reserve_exact(capacity - self.code.len());
        }
    }

    fn write_words(&mut self, words: &[u32]) {
        self.ensure_capacity(words.len());
        self.code.extend_from_slice(words);
    }

    /// Emits one instruction.
    pub fn emit(&mut self, mnemonic: &str, operands: &[Operand]) -> Result<(), VMError> {
        let lowered = mnemonic.to_ascii_lowercase();
        let instr = if lowered == PUSH_ALIAS {
            Instruction::Iconst
        } else {
            Instruction::from_mnemonic(&lowered).ok_or_else(|| {
                VMError::InvalidInstructionName {
                    name: mnemonic.to_string(),
                }
            })?
        };

        let kinds = instr.operands();
        if kinds.len() != operands.len() {
            return Err(VMError::ArityMismatch {
                instruction: instr.mnemonic(),
                expected: kinds.len(),
                actual: operands.len(),
            });
        }

        match instr.layout() {
            Layout::Stack => match (kinds.first(), operands.first()) {
                (Some(kind), Some(operand)) => self.gen_stack_operand(instr, *kind, operand),
                _ => {
                    self.write_words(&[(instr.opcode() as u32) << OPCODE_SHIFT]);
                    Ok(())
                }
            },
            Layout::Register => self.gen_register(instr, operands),
        }
    }

    fn gen_stack_operand(
        &mut self,
        instr: Instruction,
        kind: OperandKind,
        operand: &Operand,
    ) -> Result<(), VMError> {
        let mismatch = |expected: &'static str| VMError::InvalidOperand {
            instruction: instr.mnemonic(),
            arg_index: 0,
            expected,
            actual: operand.describe(),
        };

        let value = match (kind, operand) {
            (OperandKind::Int, Operand::Int(v)) => *v,
            (OperandKind::Int, Operand::Char(c)) => *c as i32,
            (OperandKind::Int, Operand::Ident(name)) => {
                if let Some(slot) = self.global_slot(name) {
                    slot as i32
                } else {
                    return self.gen_label_ref(instr, name);
                }
            }
            (OperandKind::Pool, Operand::Str(s)) => self.pool.intern(PoolEntry::Str(s.clone())) as i32,
            (OperandKind::Pool, Operand::Float(v)) => self.pool.intern(PoolEntry::Float(*v)) as i32,
            (OperandKind::Pool, Operand::Int(index)) => *index,
            (OperandKind::Func, Operand::Func(name) | Operand::Ident(name)) => {
                self.function_ref(name) as i32
            }
            (OperandKind::Int, _) => return Err(mismatch("integer, character or identifier")),
            (OperandKind::Pool, _) => return Err(mismatch("string or float literal")),
            (OperandKind::Func, _) => return Err(mismatch("function name")),
            (OperandKind::Reg | OperandKind::Imm, _) => return Err(mismatch("stack operand")),
        };

        let words = encode_stack_auto(instr.opcode(), value);
        self.write_words(&words);
        Ok(())
    }

    /// Emits an instruction whose operand is a code label, recording a patch
    /// site if the label is not yet defined.
    fn gen_label_ref(&mut self, instr: Instruction, name: &str) -> Result<(), VMError> {
        let site = self.code.len();
        let label = self
            .labels
            .entry(name.to_string())
            .or_insert_with(|| LabelSymbol::new(name));
        let word = match label.address {
            Some(address) => encode_stack(instr.opcode(), address as i32)?,
            None => {
                label.forward_refs.push(site);
                encode_stack(instr.opcode(), 0)?
            }
        };
        self.write_words(&[word]);
        Ok(())
    }

    /// Pool index of `name`, adding a forward placeholder if unseen.
    fn function_ref(&mut self, name: &str) -> u32 {
        match self.pool.function_index(name) {
            Some(index) => index,
            None => self
                .pool
                .intern(PoolEntry::Function(FunctionSymbol::forward(name))),
        }
    }

    fn gen_register(&mut self, instr: Instruction, operands: &[Operand]) -> Result<(), VMError> {
        let mut fields = RegisterFields::default();
        for (arg_index, (name, operand)) in instr
            .operand_names()
            .iter()
            .zip(operands)
            .enumerate()
        {
            let mismatch = |expected: &'static str| VMError::InvalidOperand {
                instruction: instr.mnemonic(),
                arg_index,
                expected,
                actual: operand.describe(),
            };
            match (*name, operand) {
                ("rd", Operand::Reg(r)) => fields.rd = *r,
                ("rs1", Operand::Reg(r)) => fields.rs1 = *r,
                ("rs2", Operand::Reg(r)) => fields.rs2 = *r,
                ("imm", Operand::Int(v)) => fields.imm = *v,
                ("imm", Operand::Char(c)) => fields.imm = *c as i32,
                ("imm", _) => return Err(mismatch("immediate")),
                _ => return Err(mismatch("register")),
            }
        }
        let word = encode_register(instr.opcode(), fields)?;
        self.write_words(&[word]);
        Ok(())
    }

    /// Defines a code label at the current address and backpatches every
    /// earlier reference to it.
    pub fn define_label(&mut self, name: &str) -> Result<(), VMError> {
        let address = self.ip();
        let label = self
            .labels
            .entry(name.to_string())
            .or_insert_with(|| LabelSymbol::new(name));
        if label.is_defined() {
            return Err(VMError::SymbolRedefinition {
                name: name.to_string(),
            });
        }
        label.address = Some(address);
        let sites = std::mem::take(&mut label.forward_refs);
        for site in sites {
            let opcode = opcode_of(self.code[site]);
            self.code[site] = encode_stack(opcode, address as i32)?;
        }
        Ok(())
    }

    /// Defines a function entry point at the current address.
    ///
    /// A placeholder created by an earlier `call` is replaced in place so
    /// its pool index stays stable. The function name is also a label.
    pub fn define_function(&mut self, name: &str, nargs: u16, nlocals: u16) -> Result<(), VMError> {
        let address = self.ip();
        let symbol = FunctionSymbol {
            name: name.to_string(),
            nargs,
            nlocals,
            address: Some(address),
        };
        match self.pool.function_index(name) {
            Some(index) => {
                if let Some(PoolEntry::Function(existing)) = self.pool.get(index)
                    && existing.is_defined()
                {
                    return Err(VMError::SymbolRedefinition {
                        name: name.to_string(),
                    });
                }
                self.pool.replace(index, PoolEntry::Function(symbol));
            }
            None => {
                self.pool.intern(PoolEntry::Function(symbol));
            }
        }
        self.define_label(name)?;
        if name == "main" {
            self.main = Some(address);
        }
        Ok(())
    }

    /// Defines a named global in the next free slot after the data area.
    pub fn define_global(&mut self, name: &str) -> Result<u32, VMError> {
        if self.global_slot(name).is_some() {
            return Err(VMError::SymbolRedefinition {
                name: name.to_string(),
            });
        }
        let slot = self.data_size + self.globals.len() as u32;
        self.globals.push((name.to_string(), slot));
        Ok(slot)
    }

    /// Names of labels referenced but never defined, sorted.
    pub fn unresolved_labels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .labels
            .values()
            .filter(|l| !l.is_defined())
            .map(|l| l.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Validates that every symbol is resolved and returns the linked program.
    pub fn finish(self) -> Result<Program, VMError> {
        if let Some(name) = self.unresolved_labels().first() {
            return Err(VMError::UndefinedLabel {
                name: name.to_string(),
            });
        }
        if let Some(f) = self.pool.functions().find(|f| !f.is_defined()) {
            return Err(VMError::UndefinedFunction {
                name: f.name.clone(),
            });
        }
        Ok(Program {
            code: self.code,
            constant_pool: self.pool.into_entries(),
            data_size: self.data_size,
            globals: self.globals,
            main: self.main,
        })
    }
}

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &VMError) -> Option<(usize, usize, String)> {
    match err {
        VMError::AssemblyError {
            line,
            offset,
            source,
        } => Some((*line, *offset, source.clone())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for assembly failures.
pub fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    offset: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Log a compiler-style diagnostic for assembly errors.
fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    if let Some((line, offset, message)) = assembly_error_location(err) {
        error!(
            "{}",
            render_assembly_diagnostic(file, source, line, offset, &message)
        );
    } else {
        error!("{err}");
    }
}

#[derive(Debug, Clone)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` or `;` outside a literal starts a comment
/// - commas are ignored
/// - quoted literals may contain spaces and backslash escapes
fn tokenize(line_no: usize, line: &str) -> Result<Vec<Token<'_>>, VMError> {
    let mut out = Vec::with_capacity(8);

    let mut start: Option<usize> = None;
    let mut start_col: usize = 0;
    let mut quote: Option<u8> = None;

    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if COMMENT_CHARS.contains(&(b as char)) {
            break;
        }

        match b {
            b'"' | b'\'' => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                quote = Some(b);
                i += 1;
            }

            b',' | b' ' | b'\t' => {
                if let Some(s) = start {
                    out.push(Token {
                        text: &line[s..i],
                        offset: start_col,
                    });
                    start = None;
                }
                i += 1;
            }

            _ => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                i += 1;
            }
        }
    }

    if quote.is_some() {
        return Err(VMError::AssemblyError {
            line: line_no,
            offset: start_col,
            source: "unterminated literal (missing closing quote)".to_string(),
        });
    }

    if let Some(s) = start {
        let text = line[s..bytes.len().min(i)].trim();
        if !text.is_empty() {
            out.push(Token {
                text,
                offset: start_col,
            });
        }
    }

    Ok(out)
}

/// Parse a register token like `r0`, `r31`.
pub(crate) fn parse_reg(tok: &str) -> Result<u8, VMError> {
    let digits = tok.strip_prefix('r').ok_or_else(|| VMError::InvalidOperand {
        instruction: "register",
        arg_index: 0,
        expected: "register",
        actual: tok.to_string(),
    })?;
    let register = digits.parse::<i64>().map_err(|_| VMError::InvalidOperand {
        instruction: "register",
        arg_index: 0,
        expected: "register",
        actual: tok.to_string(),
    })?;
    u8::try_from(register)
        .ok()
        .filter(|r| crate::virtual_machine::codec::is_valid_register(*r as i64))
        .ok_or(VMError::InvalidRegister { register })
}

/// Parse a decimal or `0x` hexadecimal integer.
pub(crate) fn parse_i32(tok: &str) -> Option<i32> {
    let (negative, body) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };
    let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => body.parse::<i64>().ok()?,
    };
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

/// Resolves backslash escapes inside a quoted literal body.
fn unescape(body: &str) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            _ => return None,
        });
    }
    Some(out)
}

fn parse_char(tok: &str) -> Option<char> {
    let body = tok.strip_prefix('\'')?.strip_suffix('\'')?;
    let text = unescape(body)?;
    let mut chars = text.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

fn parse_string(tok: &str) -> Option<String> {
    let body = tok.strip_prefix('"')?.strip_suffix('"')?;
    unescape(body)
}

fn is_identifier(tok: &str) -> bool {
    let mut chars = tok.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Parses one operand token according to the kind the instruction expects.
fn parse_operand(kind: OperandKind, tok: &str) -> Option<Operand> {
    match kind {
        OperandKind::Reg => parse_reg(tok).ok().map(Operand::Reg),
        OperandKind::Imm => parse_i32(tok)
            .map(Operand::Int)
            .or_else(|| parse_char(tok).map(Operand::Char)),
        OperandKind::Int => parse_i32(tok)
            .map(Operand::Int)
            .or_else(|| parse_char(tok).map(Operand::Char))
            .or_else(|| is_identifier(tok).then(|| Operand::Ident(tok.to_string()))),
        OperandKind::Pool => parse_string(tok)
            .map(Operand::Str)
            .or_else(|| parse_i32(tok).map(Operand::Int))
            .or_else(|| tok.parse::<f32>().ok().map(Operand::Float)),
        OperandKind::Func => is_identifier(tok).then(|| Operand::Func(tok.to_string())),
    }
}

/// Checks if a token is a label definition (ends with `:`).
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

/// Parses `key=value` pairs of a `.def` directive.
fn parse_def_arg(tok: &str, key: &str) -> Option<u16> {
    tok.strip_prefix(key)?.strip_prefix('=')?.parse::<u16>().ok()
}

/// Text front end driving an [`Assembler`].
struct SourceAssembler {
    asm: Assembler,
    /// First use of each symbol, for locating unresolved-symbol errors.
    first_use: BTreeMap<String, (usize, usize)>,
}

impl SourceAssembler {
    fn new() -> Self {
        Self {
            asm: Assembler::new(0),
            first_use: BTreeMap::new(),
        }
    }

    fn at(line: usize, offset: usize, err: VMError) -> VMError {
        match err {
            VMError::AssemblyError { .. } => err,
            other => VMError::AssemblyError {
                line,
                offset,
                source: other.to_string(),
            },
        }
    }

    fn line(&mut self, line_no: usize, line: &str) -> Result<(), VMError> {
        let tokens = tokenize(line_no, line)?;
        let mut rest = tokens.as_slice();

        while let Some(tok) = rest.first()
            && is_label_def(tok.text)
        {
            self.asm
                .define_label(label_name(tok.text))
                .map_err(|e| Self::at(line_no, tok.offset, e))?;
            rest = &rest[1..];
        }

        let Some((head, args)) = rest.split_first() else {
            return Ok(());
        };

        if head.text.starts_with('.') {
            return self
                .directive(line_no, head, args)
                .map_err(|e| Self::at(line_no, head.offset, e));
        }
        self.instruction(line_no, head, args)
    }

    fn directive(&mut self, line_no: usize, head: &Token, args: &[Token]) -> Result<(), VMError> {
        let invalid = |expected: &'static str| VMError::InvalidOperand {
            instruction: "directive",
            arg_index: 0,
            expected,
            actual: args
                .iter()
                .map(|t| t.text)
                .collect::<Vec<_>>()
                .join(" "),
        };
        match head.text {
            ".globals" => {
                let [count] = args else {
                    return Err(invalid("slot count"));
                };
                let n = parse_i32(count.text)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| invalid("slot count"))?;
                self.asm.set_data_size(n)
            }
            ".global" => {
                let [name] = args else {
                    return Err(invalid("global name"));
                };
                if !is_identifier(name.text) {
                    return Err(invalid("global name"));
                }
                self.asm.define_global(name.text).map(|_| ())
            }
            ".def" => {
                let Some((name, params)) = args.split_first() else {
                    return Err(invalid("function name"));
                };
                let name = name.text.trim_end_matches(LABEL_SUFFIX);
                if !is_identifier(name) {
                    return Err(invalid("function name"));
                }
                let mut nargs = 0;
                let mut nlocals = 0;
                for p in params {
                    if let Some(v) = parse_def_arg(p.text, "args") {
                        nargs = v;
                    } else if let Some(v) = parse_def_arg(p.text, "locals") {
                        nlocals = v;
                    } else {
                        return Err(Self::at(
                            line_no,
                            p.offset,
                            invalid("args=N or locals=N"),
                        ));
                    }
                }
                self.asm.define_function(name, nargs, nlocals)
            }
            other => Err(VMError::InvalidInstructionName {
                name: other.to_string(),
            }),
        }
    }

    fn instruction(&mut self, line_no: usize, head: &Token, args: &[Token]) -> Result<(), VMError> {
        let lowered = head.text.to_ascii_lowercase();
        let instr = if lowered == PUSH_ALIAS {
            Instruction::Iconst
        } else {
            Instruction::from_mnemonic(&lowered).ok_or_else(|| {
                Self::at(
                    line_no,
                    head.offset,
                    VMError::InvalidInstructionName {
                        name: head.text.to_string(),
                    },
                )
            })?
        };

        let kinds = instr.operands();
        if kinds.len() != args.len() {
            return Err(Self::at(
                line_no,
                head.offset,
                VMError::ArityMismatch {
                    instruction: instr.mnemonic(),
                    expected: kinds.len(),
                    actual: args.len(),
                },
            ));
        }

        let mut operands = Vec::with_capacity(args.len());
        for (arg_index, (kind, tok)) in kinds.iter().zip(args).enumerate() {
            let operand = parse_operand(*kind, tok.text).ok_or_else(|| {
                Self::at(
                    line_no,
                    tok.offset,
                    VMError::InvalidOperand {
                        instruction: instr.mnemonic(),
                        arg_index,
                        expected: kind.as_str(),
                        actual: tok.text.to_string(),
                    },
                )
            })?;
            if let Operand::Ident(name) | Operand::Func(name) = &operand {
                self.first_use
                    .entry(name.clone())
                    .or_insert((line_no, tok.offset));
            }
            operands.push(operand);
        }

        self.asm
            .emit(instr.mnemonic(), &operands)
            .map_err(|e| Self::at(line_no, head.offset, e))
    }

    fn finish(self) -> Result<Program, VMError> {
        let first_use = self.first_use;
        self.asm.finish().map_err(|err| {
            let location = match &err {
                VMError::UndefinedLabel { name } | VMError::UndefinedFunction { name } => {
                    first_use.get(name).copied()
                }
                _ => None,
            };
            match location {
                Some((line, offset)) => Self::at(line, offset, err),
                None => err,
            }
        })
    }
}

fn assemble_lines(source: &str) -> Result<Program, VMError> {
    let mut front = SourceAssembler::new();
    for (i, line) in source.lines().enumerate() {
        front.line(i + 1, line)?;
    }
    front.finish()
}

/// Assemble a full source string into a linked program.
pub fn assemble_source(source: impl AsRef<str>) -> Result<Program, VMError> {
    assemble_source_with_name(source.as_ref(), "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
fn assemble_source_with_name(source: &str, source_name: &str) -> Result<Program, VMError> {
    let result = assemble_lines(source);
    if let Err(err) = &result {
        log_assembly_error(source_name, source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        message: format!("{}: {}", path_ref.display(), e),
    })?;
    assemble_source_with_name(&source, &path_ref.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::codec::{decode_at, decode_register};
    use crate::virtual_machine::isa::Instruction::*;

    fn op(i: Instruction) -> u32 {
        (i.opcode() as u32) << OPCODE_SHIFT
    }

    // ==================== Event API ====================

    #[test]
    fn gen_simple_sequence() {
        let mut asm = Assembler::new(0);
        asm.emit("iconst", &[Operand::Int(2)]).unwrap();
        asm.emit("push", &[Operand::Int(3)]).unwrap();
        asm.emit("iadd", &[]).unwrap();
        asm.emit("halt", &[]).unwrap();
        let program = asm.finish().unwrap();
        assert_eq!(
            program.code,
            vec![op(Iconst) | 2, op(Iconst) | 3, op(Iadd), op(Halt)]
        );
    }

    #[test]
    fn gen_rejects_unknown_mnemonic() {
        let mut asm = Assembler::new(0);
        assert!(matches!(
            asm.emit("frobnicate", &[]),
            Err(VMError::InvalidInstructionName { .. })
        ));
    }

    #[test]
    fn gen_checks_arity() {
        let mut asm = Assembler::new(0);
        assert!(matches!(
            asm.emit("iconst", &[]),
            Err(VMError::ArityMismatch {
                expected: 1,
                actual: 0,
                ..
            })
        ));
    }

    #[test]
    fn gen_checks_operand_kind() {
        let mut asm = Assembler::new(0);
        assert!(matches!(
            asm.emit("sconst", &[Operand::Reg(1)]),
            Err(VMError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn large_operand_uses_extended_form() {
        let mut asm = Assembler::new(0);
        asm.emit("iconst", &[Operand::Int(50_000_000)]).unwrap();
        asm.emit("halt", &[]).unwrap();
        assert_eq!(asm.ip(), 3);
        let program = asm.finish().unwrap();
        let decoded = decode_at(&program.code, 0).unwrap();
        assert_eq!(decoded.immediate(), 50_000_000);
        assert_eq!(decoded.width, 2);
    }

    #[test]
    fn char_operand_is_its_code() {
        let mut asm = Assembler::new(0);
        asm.emit("cconst", &[Operand::Char('A')]).unwrap();
        assert_eq!(asm.finish().unwrap().code, vec![op(Cconst) | 65]);
    }

    // ==================== Labels ====================

    #[test]
    fn forward_label_is_backpatched() {
        let mut asm = Assembler::new(0);
        asm.emit("br", &[Operand::Ident("end".into())]).unwrap();
        asm.emit("iconst", &[Operand::Int(1)]).unwrap();
        asm.define_label("end").unwrap();
        asm.emit("halt", &[]).unwrap();
        let program = asm.finish().unwrap();
        assert_eq!(program.code[0], op(Br) | 2);
    }

    #[test]
    fn every_patch_site_is_filled() {
        let mut asm = Assembler::new(0);
        asm.emit("brf", &[Operand::Ident("out".into())]).unwrap();
        asm.emit("brt", &[Operand::Ident("out".into())]).unwrap();
        asm.emit("nop", &[]).unwrap();
        asm.define_label("out").unwrap();
        let program = asm.finish().unwrap();
        assert_eq!(program.code[0], op(Brf) | 3);
        assert_eq!(program.code[1], op(Brt) | 3);
    }

    #[test]
    fn backward_label_resolves_immediately() {
        let mut asm = Assembler::new(0);
        asm.emit("nop", &[]).unwrap();
        asm.define_label("top").unwrap();
        asm.emit("br", &[Operand::Ident("top".into())]).unwrap();
        assert_eq!(asm.label_address("top"), Some(1));
        assert_eq!(asm.finish().unwrap().code[1], op(Br) | 1);
    }

    #[test]
    fn label_redefinition_is_error() {
        let mut asm = Assembler::new(0);
        asm.define_label("x").unwrap();
        assert!(matches!(
            asm.define_label("x"),
            Err(VMError::SymbolRedefinition { ref name }) if name == "x"
        ));
    }

    #[test]
    fn unresolved_label_fails_finish() {
        let mut asm = Assembler::new(0);
        asm.emit("br", &[Operand::Ident("nowhere".into())]).unwrap();
        assert_eq!(asm.unresolved_labels(), vec!["nowhere"]);
        assert!(matches!(
            asm.finish(),
            Err(VMError::UndefinedLabel { ref name }) if name == "nowhere"
        ));
    }

    // ==================== Functions and globals ====================

    #[test]
    fn forward_call_keeps_pool_index() {
        let mut asm = Assembler::new(0);
        asm.define_function("main", 0, 0).unwrap();
        asm.emit("sconst", &[Operand::Str("hi".into())]).unwrap();
        asm.emit("call", &[Operand::Func("f".into())]).unwrap();
        asm.emit("halt", &[]).unwrap();
        asm.define_function("f", 1, 2).unwrap();
        asm.emit("ret", &[]).unwrap();
        let program = asm.finish().unwrap();

        let index = program.code[1] & 0x00FF_FFFF;
        let f = program.function(index).unwrap();
        assert_eq!(f.name, "f");
        assert_eq!(f.address, Some(3));
        assert_eq!((f.nargs, f.nlocals), (1, 2));
        assert_eq!(program.main, Some(0));
    }

    #[test]
    fn undefined_function_fails_finish() {
        let mut asm = Assembler::new(0);
        asm.emit("call", &[Operand::Func("ghost".into())]).unwrap();
        assert!(matches!(
            asm.finish(),
            Err(VMError::UndefinedFunction { ref name }) if name == "ghost"
        ));
    }

    #[test]
    fn function_redefinition_is_error() {
        let mut asm = Assembler::new(0);
        asm.define_function("f", 0, 0).unwrap();
        asm.emit("ret", &[]).unwrap();
        assert!(matches!(
            asm.define_function("f", 0, 0),
            Err(VMError::SymbolRedefinition { .. })
        ));
    }

    #[test]
    fn globals_start_after_data_area() {
        let mut asm = Assembler::new(3);
        assert_eq!(asm.define_global("a").unwrap(), 3);
        assert_eq!(asm.define_global("b").unwrap(), 4);
        assert!(asm.define_global("a").is_err());
        asm.emit("gload", &[Operand::Ident("b".into())]).unwrap();
        let program = asm.finish().unwrap();
        assert_eq!(program.code[0], op(Gload) | 4);
        assert_eq!(program.global_slots(), 5);
    }

    #[test]
    fn string_pool_is_deduplicated() {
        let mut asm = Assembler::new(0);
        asm.emit("sconst", &[Operand::Str("x".into())]).unwrap();
        asm.emit("fconst", &[Operand::Float(1.0)]).unwrap();
        asm.emit("sconst", &[Operand::Str("x".into())]).unwrap();
        let program = asm.finish().unwrap();
        assert_eq!(program.constant_pool.len(), 2);
        assert_eq!(program.code[0], program.code[2]);
    }

    #[test]
    fn register_instructions_encode_fields() {
        let mut asm = Assembler::new(0);
        asm.emit(
            "lw",
            &[Operand::Reg(3), Operand::Reg(4), Operand::Int(-8)],
        )
        .unwrap();
        let program = asm.finish().unwrap();
        let fields = decode_register(program.code[0]);
        assert_eq!((fields.rd, fields.rs1, fields.imm), (3, 4, -8));
    }

    #[test]
    fn assembly_is_deterministic() {
        let source = ".def main: args=0, locals=0\n sconst \"a\"\n print\n call f\n halt\n.def f: args=0, locals=0\n ret\n";
        let a = assemble_source(source).unwrap();
        let b = assemble_source(source).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    // ==================== Text front end ====================

    #[test]
    fn assemble_empty_source() {
        let program = assemble_source("").unwrap();
        assert!(program.code.is_empty());
    }

    #[test]
    fn assemble_comments_and_blank_lines() {
        let source = "# header\n\n  iconst 1 ; trailing\n\thalt # done\n";
        let program = assemble_source(source).unwrap();
        assert_eq!(program.code, vec![op(Iconst) | 1, op(Halt)]);
    }

    #[test]
    fn assemble_directives() {
        let source = r#"
.globals 2
.global counter
.def main: args=0, locals=1
    iconst 7
    gstore counter
    halt
"#;
        let program = assemble_source(source).unwrap();
        assert_eq!(program.data_size, 2);
        assert_eq!(program.globals, vec![("counter".to_string(), 2)]);
        assert_eq!(program.code[1], op(Gstore) | 2);
        let main = program.function_named("main").unwrap();
        assert_eq!(main.nlocals, 1);
    }

    #[test]
    fn assemble_literals() {
        let source = "cconst '\\n'\ncconst ' '\nsconst \"a, b # c\"\nfconst 2.5\niconst -0x10\n";
        let program = assemble_source(source).unwrap();
        assert_eq!(program.code[0], op(Cconst) | 10);
        assert_eq!(program.code[1], op(Cconst) | 32);
        assert_eq!(
            program.constant_pool,
            vec![PoolEntry::Str("a, b # c".into()), PoolEntry::Float(2.5)]
        );
        assert_eq!(decode_at(&program.code, 4).unwrap().immediate(), -16);
    }

    #[test]
    fn assemble_label_on_same_line() {
        let program = assemble_source("top: nop\nbr top\n").unwrap();
        assert_eq!(program.code[1], op(Br));
    }

    #[test]
    fn assemble_registers() {
        let program = assemble_source("add r1, r2, r3\njf r5, -4\n").unwrap();
        let add = decode_register(program.code[0]);
        assert_eq!((add.rd, add.rs1, add.rs2), (1, 2, 3));
        let jf = decode_register(program.code[1]);
        assert_eq!((jf.rs1, jf.imm), (5, -4));
    }

    #[test]
    fn assemble_invalid_register() {
        let err = assemble_source("mov r1, r32\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 1, offset: 9, .. }));
    }

    #[test]
    fn assemble_invalid_instruction() {
        let err = assemble_source("iconst 1\n  bogus\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 2, offset: 3, .. }));
    }

    #[test]
    fn assemble_wrong_arity() {
        let err = assemble_source("iadd 1\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 1, .. }));
    }

    #[test]
    fn assemble_unterminated_string() {
        let err = assemble_source("sconst \"oops\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 1, offset: 8, .. }));
    }

    #[test]
    fn undefined_label_points_at_first_use() {
        let err = assemble_source("nop\nbrf missing\n").unwrap_err();
        match err {
            VMError::AssemblyError {
                line,
                offset,
                source,
            } => {
                assert_eq!((line, offset), (2, 5));
                assert!(source.contains("missing"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicate_label_error() {
        let err = assemble_source("a:\na:\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 2, .. }));
    }

    #[test]
    fn bad_def_argument() {
        let err = assemble_source(".def f: args=x\n").unwrap_err();
        assert!(matches!(err, VMError::AssemblyError { line: 1, .. }));
    }

    #[test]
    fn parse_reg_bounds() {
        assert_eq!(parse_reg("r0").unwrap(), 0);
        assert_eq!(parse_reg("r31").unwrap(), 31);
        assert!(matches!(
            parse_reg("r32"),
            Err(VMError::InvalidRegister { register: 32 })
        ));
        assert!(parse_reg("x1").is_err());
    }

    #[test]
    fn parse_i32_forms() {
        assert_eq!(parse_i32("42"), Some(42));
        assert_eq!(parse_i32("-7"), Some(-7));
        assert_eq!(parse_i32("0x1F"), Some(31));
        assert_eq!(parse_i32("4294967296"), None);
        assert_eq!(parse_i32("abc"), None);
    }

    #[test]
    fn diagnostic_points_at_column() {
        let diag = render_assembly_diagnostic("t.asm", "nop\n  bogus\n", 2, 3, "bad");
        assert!(diag.contains(" --> t.asm:2:3"));
        assert!(diag.contains("   2 |   bogus"));
        assert!(diag.contains("  |   ^"));
    }

    #[test]
    fn assemble_file_reads_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.asm");
        std::fs::write(&path, "iconst 1\nhalt\n").unwrap();
        assert_eq!(assemble_file(&path).unwrap().code.len(), 2);
        assert!(matches!(
            assemble_file(dir.path().join("missing.asm")),
            Err(VMError::IoError { .. })
        ));
    }
}
