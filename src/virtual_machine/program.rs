//! Linked program representation and serialization.
//!
//! [`Program`] is the single artifact produced by the assembler and consumed
//! by the engine, the disassembler and the verifier: code words plus the
//! constant pool, global data layout and entry point.

use crate::types::encoding::{Decode, Encode};
use crate::virtual_machine::codec::{bytes_to_words, words_to_bytes};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::symbols::{FunctionSymbol, PoolEntry};
use stackvm_derive::BinaryCodec;

/// Magic bytes identifying a serialized program.
const MAGIC: &[u8; 4] = b"SVMP";

/// Current artifact format version.
const CURRENT_VERSION: Version = Version::new(1, 0, 0);

/// Semantic version for artifact format compatibility.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, BinaryCodec)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Assembled and linked program.
#[derive(Debug, Clone, Default, PartialEq, BinaryCodec)]
pub struct Program {
    /// Instruction words; every code address is an index into this vector.
    pub code: Vec<u32>,
    pub constant_pool: Vec<PoolEntry>,
    /// Number of global slots reserved before the first named global.
    pub data_size: u32,
    /// Named globals and their slot indices.
    pub globals: Vec<(String, u32)>,
    /// Word index of `main`, if defined.
    pub main: Option<u32>,
}

impl Program {
    /// Wraps raw big-endian bytecode with no symbols.
    pub fn from_code_bytes(bytes: &[u8]) -> Result<Self, VMError> {
        if bytes.is_empty() {
            return Err(VMError::EmptyProgram);
        }
        Ok(Self {
            code: bytes_to_words(bytes)?,
            ..Default::default()
        })
    }

    pub fn code_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.code)
    }

    /// Total global slots: reserved data area plus named globals.
    pub fn global_slots(&self) -> usize {
        let named = self
            .globals
            .iter()
            .map(|(_, slot)| *slot as usize + 1)
            .max()
            .unwrap_or(0);
        named.max(self.data_size as usize)
    }

    /// Word index where execution starts.
    pub fn entry_point(&self) -> usize {
        self.main.map(|m| m as usize).unwrap_or(0)
    }

    pub fn function(&self, index: u32) -> Option<&FunctionSymbol> {
        match self.constant_pool.get(index as usize) {
            Some(PoolEntry::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn function_named(&self, name: &str) -> Option<&FunctionSymbol> {
        self.constant_pool.iter().find_map(|e| match e {
            PoolEntry::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    /// Function whose entry point is `address`.
    pub fn function_at(&self, address: u32) -> Option<&FunctionSymbol> {
        self.constant_pool.iter().find_map(|e| match e {
            PoolEntry::Function(f) if f.address == Some(address) => Some(f),
            _ => None,
        })
    }

    /// Serializes the program to a portable binary format.
    ///
    /// The output includes a magic header and version for compatibility checking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        MAGIC.encode(&mut out);
        CURRENT_VERSION.encode(&mut out);
        self.encode(&mut out);
        out
    }

    /// Deserializes a program from its binary representation.
    ///
    /// Validates the magic header and version, rejecting artifacts from
    /// other format versions.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        if input.len() < MAGIC.len() {
            return Err(VMError::DecodeError {
                reason: "truncated".to_string(),
            });
        }

        if &<[u8; 4]>::decode(&mut input)? != MAGIC {
            return Err(VMError::DecodeError {
                reason: "bad magic".to_string(),
            });
        }

        if Version::decode(&mut input)? != CURRENT_VERSION {
            return Err(VMError::DecodeError {
                reason: "unsupported version".to_string(),
            });
        }

        let p = Program::decode(&mut input)?;
        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }
        Ok(p)
    }

    /// Loads either a serialized artifact or raw bytecode, by magic.
    pub fn load(bytes: &[u8]) -> Result<Self, VMError> {
        if bytes.starts_with(MAGIC) {
            Self::from_bytes(bytes)
        } else {
            Self::from_code_bytes(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        Program {
            code: vec![0x1C00_0002, 0x1C00_0003, 0x0100_0000, 0x2900_0000],
            constant_pool: vec![
                PoolEntry::Str("hello".into()),
                PoolEntry::Float(2.5),
                PoolEntry::Function(FunctionSymbol {
                    name: "main".into(),
                    nargs: 0,
                    nlocals: 1,
                    address: Some(0),
                }),
            ],
            data_size: 2,
            globals: vec![("counter".into(), 2)],
            main: Some(0),
        }
    }

    #[test]
    fn roundtrip_program() {
        let program = sample();
        let decoded = Program::from_bytes(&program.to_bytes()).unwrap();
        assert_eq!(decoded, program);
    }

    #[test]
    fn roundtrip_empty_program() {
        let program = Program::default();
        let decoded = Program::from_bytes(&program.to_bytes()).unwrap();
        assert!(decoded.code.is_empty());
        assert!(decoded.constant_pool.is_empty());
    }

    #[test]
    fn from_bytes_truncated() {
        let err = Program::from_bytes(&[0x00, 0x01]).unwrap_err();
        assert!(matches!(err, VMError::DecodeError{ref reason} if reason == "truncated"));
    }

    #[test]
    fn from_bytes_bad_magic() {
        let err = Program::from_bytes(b"BADM\x01\x00\x00").unwrap_err();
        assert!(matches!(err, VMError::DecodeError{ref reason} if reason == "bad magic"));
    }

    #[test]
    fn from_bytes_unsupported_version() {
        let mut bytes = Vec::new();
        MAGIC.encode(&mut bytes);
        Version::new(255, 0, 0).encode(&mut bytes);
        let err = Program::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, VMError::DecodeError{ref reason} if reason == "unsupported version"));
    }

    #[test]
    fn from_bytes_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0xFF);
        let err = Program::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, VMError::DecodeError{ref reason} if reason == "trailing bytes"));
    }

    #[test]
    fn from_code_bytes_checks_word_alignment() {
        assert!(matches!(
            Program::from_code_bytes(&[0x29, 0, 0]),
            Err(VMError::PartialWord { len: 3 })
        ));
        assert!(matches!(Program::from_code_bytes(&[]), Err(VMError::EmptyProgram)));
        let p = Program::from_code_bytes(&[0x29, 0, 0, 0]).unwrap();
        assert_eq!(p.code, vec![0x2900_0000]);
        assert_eq!(p.entry_point(), 0);
    }

    #[test]
    fn load_detects_artifact_by_magic() {
        let program = sample();
        assert_eq!(Program::load(&program.to_bytes()).unwrap(), program);
        assert_eq!(Program::load(&program.code_bytes()).unwrap().code, program.code);
    }

    #[test]
    fn symbol_lookups() {
        let program = sample();
        assert_eq!(program.function(2).map(|f| f.name.as_str()), Some("main"));
        assert!(program.function(0).is_none());
        assert!(program.function_named("main").is_some());
        assert!(program.function_at(0).is_some());
        assert_eq!(program.global_slots(), 3);
    }
}
