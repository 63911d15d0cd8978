//! Builder for WebAssembly guest modules that speak the tether bridge ABI.
//!
//! # Architecture
//!
//! A generated guest module follows the bridge contract:
//!
//! ## Imports
//! - every intrinsic in [`tether_types::abi::Intrinsic::ALL`], from the
//!   `tether` module, at function indices `0..INTRINSIC_COUNT`
//! - any extra host imports declared with [`GuestBuilder::import`]
//!
//! ## Exports
//! - `memory`: linear memory
//! - `__tether_malloc(size, align) -> ptr`, `__tether_realloc`, `__tether_free`
//! - `__tether_exn_store(h)` / `__tether_exn_load() -> h`: exception register
//! - `__tether_invoke(shim, a, b, arg) -> ret` / `__tether_destroy(dtor, a, b)`:
//!   closure trampolines through the function table
//! - caller-defined functions
//!
//! See [`types`] for the memory layout.

pub mod builder;
pub mod error;
pub mod runtime;
pub mod types;

pub use builder::GuestBuilder;
pub use error::{GuestError, GuestResult};
pub use runtime::memarg;
