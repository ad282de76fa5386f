//! Binary encoding and decoding traits for the linked-program artifact.
//!
//! The artifact shares the byte order of the instruction stream: every
//! multi-byte integer is big-endian, so a code word appears in the file
//! exactly as it does in raw bytecode.
//!
//! # Binary Format
//!
//! - Integers: big-endian, fixed-width
//! - `usize`: encoded as `u32` (programs never approach 4 GiB)
//! - `f32`: IEEE-754 bit pattern as `u32`
//! - `bool`: single byte (0 = false, 1 = true)
//! - `Vec<T>`/`String`: 4-byte length prefix followed by elements
//! - `Option<T>`: 1-byte tag (0 = None, 1 = Some) followed by value if present
//! - Arrays `[T; N]`: elements back to back, no length prefix

use stackvm_derive::Error;

/// Sink for writing encoded bytes.
pub trait EncodeSink {
    fn write(&mut self, bytes: &[u8]);
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Counts bytes instead of storing them; used to size buffers up front.
#[derive(Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    pub fn len(&self) -> usize {
        self.len
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

/// Types that can be written in the artifact format.
pub trait Encode {
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Encodes into a freshly allocated buffer of exactly the right size.
    fn to_bytes(&self) -> Vec<u8> {
        let mut counter = SizeCounter::default();
        self.encode(&mut counter);
        let mut out = Vec::with_capacity(counter.len());
        self.encode(&mut out);
        out
    }
}

/// Errors produced while decoding an artifact.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid value")]
    InvalidValue,
    #[error("length prefix too large")]
    LengthOverflow,
}

/// Types that can be read back from the artifact format.
pub trait Decode: Sized {
    /// Reads one value, advancing `input` past the consumed bytes.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a whole buffer; trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::InvalidValue);
        }
        Ok(value)
    }
}

/// Splits `n` bytes off the front of `input`.
fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if input.len() < n {
        return Err(DecodeError::UnexpectedEof);
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

macro_rules! impl_be_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_be_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    let n = raw.len();
                    raw.copy_from_slice(take(input, n)?);
                    Ok(<$t>::from_be_bytes(raw))
                }
            }
        )*
    };
}

impl_be_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Encode for usize {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        // Lengths and indices above u32::MAX cannot be produced by the assembler.
        (u32::try_from(*self).unwrap_or(u32::MAX)).encode(out);
    }
}

impl Decode for usize {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let v = u32::decode(input)?;
        usize::try_from(v).map_err(|_| DecodeError::LengthOverflow)
    }
}

impl Encode for f32 {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.to_bits().encode(out);
    }
}

impl Decode for f32 {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(f32::from_bits(u32::decode(input)?))
    }
}

impl Encode for bool {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[u8::from(*self)]);
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

/// Upper bound on decoded collection lengths.
const MAX_LEN: usize = 1 << 24;

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = usize::decode(input)?;
        if len > MAX_LEN {
            return Err(DecodeError::LengthOverflow);
        }
        // Cap the pre-allocation by what the input could possibly hold.
        let mut items = Vec::with_capacity(len.min(input.len()));
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl Encode for String {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_str().encode(out);
    }
}

impl Encode for &str {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = usize::decode(input)?;
        if len > MAX_LEN {
            return Err(DecodeError::LengthOverflow);
        }
        let raw = take(input, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidValue)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            None => 0u8.encode(out),
            Some(v) => {
                1u8.encode(out);
                v.encode(out);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(input)?)),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(take(input, N)?);
        Ok(raw)
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.0.encode(out);
        self.1.encode(out);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok((A::decode(input)?, B::decode(input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_allocates_exact_capacity() {
        let data: Vec<u16> = vec![1, 2, 3];
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 4 + 6);
        assert_eq!(bytes.capacity(), bytes.len());
    }

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(0x1234_5678u32.to_bytes(), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!((-2i16).to_bytes(), vec![0xFF, 0xFE]);
        assert_eq!(u32::from_bytes(&[0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn decode_advances_through_mixed_integers() {
        let mut bytes = (-5i32).to_bytes();
        bytes.extend_from_slice(&0xBEEFu16.to_bytes());
        bytes.extend_from_slice(&u64::MAX.to_bytes());
        let mut input = &bytes[..];
        assert_eq!(i32::decode(&mut input).unwrap(), -5);
        assert_eq!(u16::decode(&mut input).unwrap(), 0xBEEF);
        assert_eq!(u64::decode(&mut input).unwrap(), u64::MAX);
        assert!(input.is_empty());
    }

    #[test]
    fn f32_keeps_bit_pattern() {
        let v = -3.5f32;
        let decoded = f32::from_bytes(&v.to_bytes()).unwrap();
        assert_eq!(decoded.to_bits(), v.to_bits());
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(bool::from_bytes(&[1]).unwrap());
        assert_eq!(bool::from_bytes(&[2]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn vec_has_u32_length_prefix() {
        let bytes = vec![0xAAu8, 0xBB].to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..], &[0xAA, 0xBB]);
    }

    #[test]
    fn vec_length_overflow_is_rejected() {
        let bytes = ((MAX_LEN as u32) + 1).to_bytes();
        assert_eq!(Vec::<u8>::from_bytes(&bytes), Err(DecodeError::LengthOverflow));
    }

    #[test]
    fn truncated_input_is_eof() {
        assert_eq!(u32::from_bytes(&[0, 1]), Err(DecodeError::UnexpectedEof));
        let mut bytes = 5usize.to_bytes();
        bytes.extend_from_slice(b"ab");
        assert_eq!(String::from_bytes(&bytes), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut bytes = 2usize.to_bytes();
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(String::from_bytes(&bytes), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn str_and_string_encode_identically() {
        assert_eq!("main".to_bytes(), "main".to_string().to_bytes());
    }

    #[test]
    fn option_tags() {
        assert_eq!(None::<u8>.to_bytes(), vec![0]);
        assert_eq!(Some(7u8).to_bytes(), vec![1, 7]);
        assert_eq!(Option::<u8>::from_bytes(&[3, 0]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert_eq!(u8::from_bytes(&[1, 2]), Err(DecodeError::InvalidValue));
    }
}
