//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations from
//! an `#[error("...")]` attribute on every variant (or on the struct itself).
//!
//! # Usage
//!
//! ```ignore
//! use stackvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum AsmError {
//!     #[error("unknown instruction: {0}")]
//!     Unknown(String),
//!
//!     #[error("line {line}: {message}")]
//!     Syntax { line: usize, column: usize, message: String },
//!
//!     #[error("empty program")]
//!     Empty,
//! }
//! ```
//!
//! Only the fields that the message actually interpolates are bound, so a
//! variant may carry extra context (`column` above) that is not displayed.
//! Positional placeholders (`{0}`, `{1:?}`) are rewritten to generated names.
//!
//! Expressions after the message are passed to `write!` as positional
//! arguments for `{}` placeholders; `self` is in scope:
//!
//! ```ignore
//! #[derive(Debug, Error)]
//! #[error("{name}{}", if self.hint.is_empty() { "" } else { " (see hint)" })]
//! pub struct Missing { name: String, hint: String }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use std::collections::BTreeSet;
use syn::punctuated::Punctuated;
use syn::{Data, DeriveInput, Expr, Fields, Lit, Meta, Token, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data_enum) => {
            let arms = data_enum
                .variants
                .iter()
                .map(|variant| {
                    let message = message_from_attrs(
                        &variant.attrs,
                        &variant.ident,
                        &format!("variant `{}`", variant.ident),
                    )?;
                    let ident = &variant.ident;
                    Ok(display_arm(quote!(Self::#ident), &variant.fields, &message))
                })
                .collect::<syn::Result<Vec<_>>>()?;
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data_struct) => {
            let message =
                message_from_attrs(&input.attrs, &input.ident, &format!("type `{}`", name))?;
            let arm = display_arm(quote!(Self), &data_struct.fields, &message);
            quote! {
                match self {
                    #arm
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Builds one `pattern => write!(...)` arm binding only the referenced fields.
fn display_arm(path: TokenStream2, fields: &Fields, message: &Message) -> TokenStream2 {
    let Message { text, args } = message;
    let message = text.as_str();
    match fields {
        Fields::Unit => quote! {
            #path => write!(f, #message #(, #args)*),
        },
        Fields::Named(named) => {
            let used = placeholders(message);
            let bound: Vec<_> = named
                .named
                .iter()
                .filter_map(|field| field.ident.as_ref())
                .filter(|ident| used.contains(&ident.to_string()))
                .collect();
            quote! {
                #path { #(#bound,)* .. } => write!(f, #message, #(#args,)* #(#bound = #bound),*),
            }
        }
        Fields::Unnamed(unnamed) => {
            let count = unnamed.unnamed.len();
            let message = positional_to_named(message, count);
            let used = placeholders(&message);
            let mut patterns = Vec::with_capacity(count);
            let mut bound = Vec::new();
            for i in 0..count {
                let ident = format_ident!("f{}", i);
                if used.contains(&ident.to_string()) {
                    patterns.push(ident.to_token_stream());
                    bound.push(ident);
                } else {
                    patterns.push(quote!(_));
                }
            }
            quote! {
                #path(#(#patterns),*) => write!(f, #message, #(#args,)* #(#bound = #bound),*),
            }
        }
    }
}

/// Collects the argument names referenced by a format string (`{name}`, `{name:?}`).
fn placeholders(message: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut chars = message.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' || c == ':' {
                        break;
                    }
                    name.push(c);
                }
                let name = name.trim();
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
            _ => {}
        }
    }
    names
}

/// Converts positional format args `{0}`, `{1:?}` to generated names `{f0}`, `{f1:?}`.
fn positional_to_named(message: &str, count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..count).rev() {
        out = out
            .replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    out
}

/// Format string of an `#[error]` attribute plus any trailing argument expressions.
struct Message {
    text: String,
    args: Vec<Expr>,
}

fn message_from_attrs<T: ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
    target_desc: &str,
) -> syn::Result<Message> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!(
                "missing #[error(\"...\")] attribute on {target_desc}; every error variant must declare a display message"
            ),
        ));
    };

    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "invalid #[error] attribute; use #[error(\"message\")] to describe the error",
        ));
    };

    let invalid = || {
        syn::Error::new_spanned(
            &attr.meta,
            "#[error] expects a string literal, e.g. #[error(\"invalid opcode {0}\")]",
        )
    };
    let mut exprs = list
        .parse_args_with(Punctuated::<Expr, Token![,]>::parse_terminated)
        .map_err(|_| invalid())?
        .into_iter();
    let text = match exprs.next() {
        Some(Expr::Lit(syn::ExprLit {
            lit: Lit::Str(lit), ..
        })) => lit.value(),
        _ => return Err(invalid()),
    };
    Ok(Message {
        text,
        args: exprs.collect(),
    })
}
