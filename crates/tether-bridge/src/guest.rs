//! The seam between the bridge and whatever runs the guest.

use tether_types::{BridgeResult, Handle};

use crate::bridge::Bridge;

/// The bridge's view of a running guest instance.
///
/// Implemented by the wasm runtime over a live store, and by in-memory
/// simulations in tests. Every method that calls into the guest may grow its
/// memory, so callers must not hold memory slices across them.
pub trait Guest {
    /// The guest's linear memory and the bridge state, borrowed together.
    fn split(&mut self) -> (&mut [u8], &mut Bridge);

    fn bridge(&mut self) -> &mut Bridge {
        self.split().1
    }

    fn memory(&mut self) -> &mut [u8] {
        self.split().0
    }

    /// `malloc(size, align) -> ptr` exported by the guest.
    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32>;

    /// Whether the guest exports a reallocator.
    fn has_realloc(&self) -> bool;

    /// `realloc(ptr, old_size, new_size, align) -> ptr`.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32>;

    /// Run the closure body `shim` with its state words and one argument handle.
    fn invoke(&mut self, shim: u32, a: u32, b: u32, arg: Handle) -> BridgeResult<Handle>;

    /// Run the closure destructor `dtor` over its state words.
    fn destroy(&mut self, dtor: u32, a: u32, b: u32) -> BridgeResult<()>;

    /// Hand a captured exception to the guest's own exception register.
    ///
    /// Returns `true` when the guest took ownership of `handle`. The default
    /// keeps the exception in the host-side error slot.
    fn exn_store(&mut self, handle: Handle) -> BridgeResult<bool> {
        let _ = handle;
        Ok(false)
    }
}
