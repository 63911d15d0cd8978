//! Engine-independent core of the tether bridge.
//!
//! The guest refers to host values only through integer [`Handle`]s kept in
//! a [`HandleTable`]. Text and typed data cross through [`MemoryViews`] over
//! the guest's linear memory. Guest closures become reference-counted
//! [`Closure`]s, and failing host operations are captured by the error
//! channel in [`exn`] instead of unwinding into guest code.
//!
//! Everything that needs the running guest goes through the [`Guest`] trait,
//! so this crate never depends on a particular wasm engine.
//!
//! [`Handle`]: tether_types::Handle

mod bridge;
pub mod closure;
pub mod exn;
mod guest;
pub mod heap;
pub mod memory;
pub mod string;
pub mod value;

pub use bridge::Bridge;
pub use closure::{Closure, ClosureKind, FinalizationRegistry, FinalizeTask};
pub use exn::ErrorSlot;
pub use guest::Guest;
pub use heap::HandleTable;
pub use memory::MemoryViews;
pub use value::{ArrayKind, HostFunction, HostValue, Opaque, TypedArray};
