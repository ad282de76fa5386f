//! Derive macros for the stackvm crate.
//!
//! Provides:
//! - `#[derive(BinaryCodec)]` - big-endian `Encode`/`Decode` for program artifacts
//! - `#[derive(Error)]` - `Display` + `std::error::Error` from `#[error("...")]` attributes

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `crate::types::encoding::{Encode, Decode}` field by field.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display` and `Error` for error enums and structs.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
