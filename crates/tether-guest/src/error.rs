//! Guest builder error types.

use thiserror::Error;

/// Errors that can occur while assembling a guest module.
#[derive(Debug, Error)]
pub enum GuestError {
    /// A host import was declared after function indices were handed out.
    #[error("import `{module}.{name}` declared after functions; declare imports first")]
    ImportAfterFunctions { module: String, name: String },

    /// Two exports share a name.
    #[error("duplicate export: {0}")]
    DuplicateExport(String),

    /// Static data does not fit below the heap.
    #[error("data segment of {len} bytes does not fit (only {available} left)")]
    DataOverflow { len: usize, available: u32 },

    /// A table entry names a function that does not exist.
    #[error("unknown function index {0}")]
    UnknownFunction(u32),

    /// The generated WASM module failed validation.
    #[error("WASM validation failed: {0}")]
    ValidationFailed(String),
}

/// Guest builder result type alias.
pub type GuestResult<T> = Result<T, GuestError>;
