//! Derive macro for the artifact binary format.
//!
//! Generates `crate::types::encoding::Encode` and `Decode` implementations.
//! Fields are written in declaration order; enums write a one-byte
//! discriminant first (explicit `= N` values are honored, otherwise the
//! previous value plus one).
//!
//! ```ignore
//! use stackvm_derive::BinaryCodec;
//!
//! #[derive(BinaryCodec)]
//! pub struct FunctionRecord {
//!     pub name: String,
//!     pub nargs: u16,
//!     pub address: u32,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, parse_macro_input};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => (
            encode_struct(&data.fields),
            decode_fields(quote!(Self), &data.fields),
        ),
        Data::Enum(data) => expand_enum(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

fn encode_struct(fields: &Fields) -> TokenStream2 {
    let accessors: Vec<TokenStream2> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .map(|f| {
                let ident = &f.ident;
                quote!(self.#ident)
            })
            .collect(),
        Fields::Unnamed(unnamed) => (0..unnamed.unnamed.len())
            .map(|i| {
                let index = syn::Index::from(i);
                quote!(self.#index)
            })
            .collect(),
        Fields::Unit => Vec::new(),
    };
    quote! {
        #( crate::types::encoding::Encode::encode(&#accessors, out); )*
    }
}

/// Builds `Ok(path { .. })` / `Ok(path(..))` decoding each field in order.
fn decode_fields(path: TokenStream2, fields: &Fields) -> TokenStream2 {
    match fields {
        Fields::Named(named) => {
            let idents = named.named.iter().map(|f| &f.ident);
            quote! {
                Ok(#path { #( #idents: crate::types::encoding::Decode::decode(input)?, )* })
            }
        }
        Fields::Unnamed(unnamed) => {
            let reads = (0..unnamed.unnamed.len())
                .map(|_| quote!(crate::types::encoding::Decode::decode(input)?));
            quote! {
                Ok(#path( #(#reads),* ))
            }
        }
        Fields::Unit => quote!(Ok(#path)),
    }
}

fn expand_enum(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let mut encode_arms = Vec::with_capacity(data.variants.len());
    let mut decode_arms = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => explicit_discriminant(expr)?,
            None => u8::try_from(next).map_err(|_| {
                syn::Error::new_spanned(&variant.ident, "BinaryCodec supports at most 256 variants")
            })?,
        };
        next = u16::from(tag) + 1;

        let ident = &variant.ident;
        let (pattern, writes) = match &variant.fields {
            Fields::Named(named) => {
                let idents: Vec<_> = named.named.iter().map(|f| &f.ident).collect();
                (
                    quote!(Self::#ident { #(#idents),* }),
                    quote!(#( crate::types::encoding::Encode::encode(#idents, out); )*),
                )
            }
            Fields::Unnamed(unnamed) => {
                let idents: Vec<_> = (0..unnamed.unnamed.len())
                    .map(|i| format_ident!("f{}", i))
                    .collect();
                (
                    quote!(Self::#ident( #(#idents),* )),
                    quote!(#( crate::types::encoding::Encode::encode(#idents, out); )*),
                )
            }
            Fields::Unit => (quote!(Self::#ident), quote!()),
        };

        encode_arms.push(quote! {
            #pattern => {
                crate::types::encoding::Encode::encode(&#tag, out);
                #writes
            }
        });

        let build = decode_fields(quote!(Self::#ident), &variant.fields);
        decode_arms.push(quote!(#tag => #build,));
    }

    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let tag: u8 = crate::types::encoding::Decode::decode(input)?;
        match tag {
            #(#decode_arms)*
            _ => Err(crate::types::encoding::DecodeError::InvalidValue),
        }
    };
    Ok((encode, decode))
}

fn explicit_discriminant(expr: &syn::Expr) -> syn::Result<u8> {
    if let syn::Expr::Lit(syn::ExprLit {
        lit: syn::Lit::Int(int),
        ..
    }) = expr
    {
        return int.base10_parse::<u8>();
    }
    Err(syn::Error::new_spanned(
        expr,
        "BinaryCodec discriminants must be integer literals in 0..=255",
    ))
}
