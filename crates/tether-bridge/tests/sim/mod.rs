//! An in-memory guest for exercising the bridge without a wasm engine.
//!
//! Memory is a `Vec<u8>` that is reallocated on growth, the allocator is a
//! bump pointer, and closure bodies are Rust callbacks keyed by shim index.
#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;

use tether_bridge::{Bridge, Guest};
use tether_types::{BridgeConfig, BridgeError, BridgeResult, Handle};

pub const PAGE: usize = 64 * 1024;

/// A closure body: `(guest, a, b, arg) -> ret`.
pub type Shim = Rc<dyn Fn(&mut SimGuest, u32, u32, Handle) -> BridgeResult<Handle>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Malloc { size: u32, align: u32 },
    Realloc { ptr: u32, old: u32, new: u32 },
    Invoke { shim: u32, a: u32, b: u32 },
    Destroy { dtor: u32, a: u32, b: u32 },
    ExnStore(Handle),
}

pub struct SimGuest {
    pub memory: Vec<u8>,
    pub bridge: Bridge,
    pub calls: Vec<Call>,
    pub realloc: bool,
    pub exn_register: Option<Option<Handle>>,
    shims: HashMap<u32, Shim>,
    top: u32,
}

impl SimGuest {
    pub fn new() -> Self {
        Self::with_config(&BridgeConfig::default())
    }

    pub fn with_config(config: &BridgeConfig) -> Self {
        Self {
            memory: vec![0; PAGE],
            bridge: Bridge::new(config),
            calls: Vec::new(),
            realloc: true,
            exn_register: None,
            shims: HashMap::new(),
            // Leave the low words free for out-parameters.
            top: 64,
        }
    }

    pub fn without_realloc(mut self) -> Self {
        self.realloc = false;
        self
    }

    /// Accept captured exceptions into a guest-side register.
    pub fn with_exn_register(mut self) -> Self {
        self.exn_register = Some(None);
        self
    }

    pub fn on_invoke(
        &mut self,
        shim: u32,
        body: impl Fn(&mut SimGuest, u32, u32, Handle) -> BridgeResult<Handle> + 'static,
    ) {
        self.shims.insert(shim, Rc::new(body));
    }

    pub fn destroys(&self) -> Vec<(u32, u32, u32)> {
        self.calls
            .iter()
            .filter_map(|call| match *call {
                Call::Destroy { dtor, a, b } => Some((dtor, a, b)),
                _ => None,
            })
            .collect()
    }

    pub fn reallocs(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::Realloc { .. }))
            .count()
    }

    /// Grow memory by whole pages, moving it to a fresh buffer.
    pub fn grow(&mut self, pages: usize) {
        let mut grown = vec![0; self.memory.len() + pages * PAGE];
        grown[..self.memory.len()].copy_from_slice(&self.memory);
        self.memory = grown;
    }

    fn bump(&mut self, size: u32, align: u32) -> u32 {
        let align = align.max(1);
        let ptr = self.top.div_ceil(align) * align;
        self.top = ptr + size;
        while self.top as usize > self.memory.len() {
            self.grow(1);
        }
        ptr
    }
}

impl Guest for SimGuest {
    fn split(&mut self) -> (&mut [u8], &mut Bridge) {
        (&mut self.memory, &mut self.bridge)
    }

    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        self.calls.push(Call::Malloc { size, align });
        Ok(self.bump(size, align))
    }

    fn has_realloc(&self) -> bool {
        self.realloc
    }

    fn realloc(&mut self, ptr: u32, old: u32, new: u32, align: u32) -> BridgeResult<u32> {
        self.calls.push(Call::Realloc { ptr, old, new });
        if ptr + old == self.top {
            self.top = ptr;
            return Ok(self.bump(new, align));
        }
        let fresh = self.bump(new, align);
        let keep = old.min(new) as usize;
        self.memory
            .copy_within(ptr as usize..ptr as usize + keep, fresh as usize);
        Ok(fresh)
    }

    fn invoke(&mut self, shim: u32, a: u32, b: u32, arg: Handle) -> BridgeResult<Handle> {
        self.calls.push(Call::Invoke { shim, a, b });
        let body = self
            .shims
            .get(&shim)
            .cloned()
            .ok_or_else(|| BridgeError::Guest(format!("no shim {shim}")))?;
        body(self, a, b, arg)
    }

    fn destroy(&mut self, dtor: u32, a: u32, b: u32) -> BridgeResult<()> {
        self.calls.push(Call::Destroy { dtor, a, b });
        Ok(())
    }

    fn exn_store(&mut self, handle: Handle) -> BridgeResult<bool> {
        match &mut self.exn_register {
            Some(register) => {
                *register = Some(handle);
                self.calls.push(Call::ExnStore(handle));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
