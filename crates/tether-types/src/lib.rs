//! Shared types for the tether bridge.
//!
//! This crate defines the handle type, error types, configuration and the
//! intrinsic import table shared by the host runtime and the guest module
//! builder.

pub mod abi;
mod config;
mod error;
mod handle;

pub use config::{AbiNames, BridgeConfig};
pub use error::{BridgeError, HostException};
pub use handle::{GuestStr, Handle, RESERVED_HANDLES};

/// Result type used throughout the bridge.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
