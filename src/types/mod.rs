//! Serialization primitives shared by the program artifact and the derive macros.

pub mod encoding;
