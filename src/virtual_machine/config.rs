//! Machine configuration.
//!
//! [`VMConfig`] is built once, validated, and never mutated by the machine.
//! Construct it with struct-update syntax over [`VMConfig::default`]:
//!
//! ```
//! use stackvm::virtual_machine::config::VMConfig;
//!
//! let config = VMConfig {
//!     stack_size: 256,
//!     max_steps: Some(10_000),
//!     ..VMConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::virtual_machine::errors::VMError;

/// Bytes charged per struct field against `heap_size`.
pub const FIELD_SIZE: usize = 4;

/// Collector implementation selected at construction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GcKind {
    #[default]
    RefCounting,
    /// Never frees; objects stay alive until reset.
    None,
}

impl GcKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GcKind::RefCounting => "reference-counting",
            GcKind::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VMConfig {
    /// Heap capacity in bytes.
    pub heap_size: usize,
    /// Operand-stack capacity in slots.
    pub stack_size: usize,
    /// Maximum live call frames, including the entry frame.
    pub max_frames: usize,
    /// Largest loadable program, in words.
    pub instruction_cache_size: usize,
    /// Cycle budget per run; `None` is unbounded.
    pub max_steps: Option<u64>,
    pub gc_enabled: bool,
    pub gc_kind: GcKind,
    /// Log every cycle at debug level.
    pub trace: bool,
    /// Log lifecycle events and call/return at debug level.
    pub debug: bool,
    /// Attach a core dump to unrecovered fault logs.
    pub verbose_errors: bool,
}

impl Default for VMConfig {
    fn default() -> Self {
        Self {
            heap_size: 1024 * 1024,
            stack_size: 1024,
            max_frames: 1000,
            instruction_cache_size: 64 * 1024,
            max_steps: None,
            gc_enabled: true,
            gc_kind: GcKind::RefCounting,
            trace: false,
            debug: false,
            verbose_errors: false,
        }
    }
}

impl VMConfig {
    /// Rejects zero-sized limits.
    pub fn validate(&self) -> Result<(), VMError> {
        let checks: [(&str, bool); 5] = [
            ("heap_size", self.heap_size > 0),
            ("stack_size", self.stack_size > 0),
            ("max_frames", self.max_frames > 0),
            ("instruction_cache_size", self.instruction_cache_size > 0),
            ("max_steps", self.max_steps != Some(0)),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(VMError::InvalidConfig {
                    reason: format!("{name} must be positive"),
                });
            }
        }
        Ok(())
    }

    /// True if the reference-counting collector should be used.
    pub fn uses_refcounting(&self) -> bool {
        self.gc_enabled && self.gc_kind == GcKind::RefCounting
    }

    /// Heap capacity in struct fields.
    pub fn heap_fields(&self) -> usize {
        self.heap_size / FIELD_SIZE
    }
}
