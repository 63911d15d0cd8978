//! Per-instance bridge state.
//!
//! The handle table, memory view cache, error slot and finalization queue
//! live together in one [`Bridge`], owned by the guest instance.

use tether_types::{BridgeConfig, BridgeError, BridgeResult, Handle};

use crate::closure::{Closure, ClosureKind, FinalizationRegistry};
use crate::exn::ErrorSlot;
use crate::heap::HandleTable;
use crate::memory::MemoryViews;
use crate::value::HostValue;

/// All per-instance bridge state.
///
/// One `Bridge` belongs to exactly one guest instance and lives as long as it.
#[derive(Debug)]
pub struct Bridge {
    pub heap: HandleTable,
    pub views: MemoryViews,
    pub exn: ErrorSlot,
    finalizers: FinalizationRegistry,
    string_fast_path: bool,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}

impl Bridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            heap: HandleTable::with_capacity(config.initial_capacity),
            views: MemoryViews::new(),
            exn: ErrorSlot::default(),
            finalizers: FinalizationRegistry::new(),
            string_fast_path: config.string_fast_path,
        }
    }

    /// The live value behind `handle`.
    pub fn value(&self, handle: Handle) -> BridgeResult<&HostValue> {
        self.heap
            .resolve(handle)
            .ok_or(BridgeError::InvalidHandle(handle))
    }

    /// Store `value` and return its new handle.
    pub fn allocate(&mut self, value: impl Into<HostValue>) -> Handle {
        self.heap.allocate(value.into())
    }

    /// The closure behind `handle`.
    pub fn closure(&self, handle: Handle) -> BridgeResult<Closure> {
        match self.value(handle)? {
            HostValue::Closure(closure) => Ok(closure.clone()),
            other => Err(BridgeError::TypeMismatch {
                handle,
                expected: "closure",
                found: other.type_name(),
            }),
        }
    }

    /// Wrap a guest closure and return a handle to it.
    pub fn wrap_closure(&mut self, a: u32, b: u32, dtor: u32, shim: u32, kind: ClosureKind) -> Handle {
        let closure = Closure::wrap(&self.finalizers, a, b, dtor, shim, kind);
        self.heap.allocate(HostValue::Closure(closure))
    }

    pub fn finalizers(&self) -> &FinalizationRegistry {
        &self.finalizers
    }

    pub fn string_fast_path(&self) -> bool {
        self.string_fast_path
    }
}
