//! [`Guest`] over a `wasmi` store or caller.
//!
//! Calls into the guest's allocator, closure shims and exception register go
//! through the exports resolved at instantiation.

use tether_bridge::{Bridge, Guest};
use tether_types::{BridgeError, BridgeResult, Handle};
use wasmi::AsContextMut;

use crate::state::{from_wasmi, GuestExports, HostState};

/// A live guest seen through a `wasmi` store or caller.
///
/// `C` is a `Caller` inside an intrinsic, or `&mut Store` from the embedder.
pub struct GuestContext<C> {
    ctx: C,
    exports: GuestExports,
}

impl<C: AsContextMut<Data = HostState>> GuestContext<C> {
    /// Fails until the instance's bridge exports have been resolved.
    pub fn new(ctx: C) -> BridgeResult<Self> {
        let exports = ctx
            .as_context()
            .data()
            .exports
            .clone()
            .ok_or(BridgeError::NotInitialized)?;
        Ok(Self { ctx, exports })
    }

    pub fn ctx(&mut self) -> &mut C {
        &mut self.ctx
    }
}

fn word(value: u32) -> i32 {
    value as i32
}

impl<C: AsContextMut<Data = HostState>> Guest for GuestContext<C> {
    fn split(&mut self) -> (&mut [u8], &mut Bridge) {
        let (mem, state) = self
            .exports
            .memory
            .data_and_store_mut(self.ctx.as_context_mut());
        (mem, &mut state.bridge)
    }

    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        self.exports
            .malloc
            .call(&mut self.ctx, (word(size), word(align)))
            .map(|ptr| ptr as u32)
            .map_err(from_wasmi)
    }

    fn has_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32> {
        let realloc = self
            .exports
            .realloc
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport("realloc".to_string()))?;
        realloc
            .call(
                &mut self.ctx,
                (word(ptr), word(old_size), word(new_size), word(align)),
            )
            .map(|ptr| ptr as u32)
            .map_err(from_wasmi)
    }

    fn invoke(&mut self, shim: u32, a: u32, b: u32, arg: Handle) -> BridgeResult<Handle> {
        let invoke = self
            .exports
            .invoke
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport("invoke".to_string()))?;
        invoke
            .call(&mut self.ctx, (word(shim), word(a), word(b), arg.to_abi()))
            .map(Handle::from_abi)
            .map_err(from_wasmi)
    }

    fn destroy(&mut self, dtor: u32, a: u32, b: u32) -> BridgeResult<()> {
        let destroy = self
            .exports
            .destroy
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport("destroy".to_string()))?;
        destroy
            .call(&mut self.ctx, (word(dtor), word(a), word(b)))
            .map_err(from_wasmi)
    }

    fn exn_store(&mut self, handle: Handle) -> BridgeResult<bool> {
        match &self.exports.exn_store {
            Some(store) => {
                store
                    .call(&mut self.ctx, handle.to_abi())
                    .map_err(from_wasmi)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
