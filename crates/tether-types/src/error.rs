//! Bridge failures and the exceptions they turn into.
//!
//! [`BridgeError`] is what bridge operations return. Inside a captured host
//! call, catchable errors become a [`HostException`] the guest can inspect.

use crate::Handle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Text crossing the boundary was not well-formed UTF-8.
    #[error("malformed UTF-8 in guest string at {ptr} (+{len} bytes)")]
    Decode {
        ptr: u32,
        len: u32,
        #[source]
        source: std::str::Utf8Error,
    },

    /// A guest pointer/length pair falls outside linear memory.
    #[error("guest access out of bounds: {offset}+{len} exceeds memory of {memory_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        memory_len: usize,
    },

    /// A typed view was addressed with a pointer not aligned to its element width.
    #[error("guest pointer {ptr} is not aligned to {width} bytes")]
    Misaligned { ptr: u32, width: usize },

    /// The handle is out of range or names a free slot.
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    /// The handle is live but holds a value of the wrong kind.
    #[error("handle {handle} holds {found}, expected {expected}")]
    TypeMismatch {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },

    /// A closure was invoked after its destructor ran.
    #[error("closure invoked after it was destroyed")]
    ClosureDestroyed,

    /// The guest module does not export something the bridge needs.
    #[error("guest module is missing export `{0}`")]
    MissingExport(String),

    /// Guest code trapped or otherwise failed while the bridge was calling it.
    #[error("guest call failed: {0}")]
    Guest(String),

    /// The guest raised an error through the `throw` intrinsic.
    #[error("guest threw: {0}")]
    GuestThrow(String),

    /// A host exception escaped a call that was not routed through the error channel.
    #[error("uncaught host exception: {0}")]
    Exception(#[from] HostException),

    /// The guest module failed to compile.
    #[error("failed to compile guest module: {0}")]
    Compile(String),

    /// The guest module failed to link or instantiate.
    #[error("failed to instantiate guest module: {0}")]
    Instantiate(String),

    /// A bridge operation needed a live instance before initialisation.
    #[error("guest module is not initialised")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl BridgeError {
    /// Bounds-check `offset..offset+len` against a memory of `memory_len` bytes.
    pub fn check_bounds(offset: usize, len: usize, memory_len: usize) -> Result<(), Self> {
        match offset.checked_add(len) {
            Some(end) if end <= memory_len => Ok(()),
            _ => Err(Self::OutOfBounds {
                offset,
                len,
                memory_len,
            }),
        }
    }

    /// Whether a captured host call turns this error into a guest-visible
    /// exception. A guest `throw` that unwinds out of a nested guest call is
    /// catchable; guest traps and engine failures propagate instead.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::OutOfBounds { .. }
                | Self::Misaligned { .. }
                | Self::InvalidHandle(_)
                | Self::TypeMismatch { .. }
                | Self::ClosureDestroyed
                | Self::GuestThrow(_)
                | Self::Exception(_)
        )
    }
}

/// A host-side exception object.
///
/// This is what a failing host operation "throws". The error channel stores it
/// in the handle table so that guest code can inspect it later.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct HostException {
    /// Constructor name, e.g. `Error`, `TypeError`.
    pub name: String,
    pub message: String,
}

impl HostException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// A plain `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new("RangeError", message)
    }
}

/// Bridge faults raised inside a captured host call surface as exceptions.
impl From<BridgeError> for HostException {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Exception(exn) => exn,
            BridgeError::GuestThrow(message) => Self::error(message),
            BridgeError::Decode { .. }
            | BridgeError::InvalidHandle(_)
            | BridgeError::TypeMismatch { .. }
            | BridgeError::ClosureDestroyed => Self::type_error(err.to_string()),
            BridgeError::OutOfBounds { .. } | BridgeError::Misaligned { .. } => {
                Self::range_error(err.to_string())
            }
            other => Self::error(other.to_string()),
        }
    }
}
