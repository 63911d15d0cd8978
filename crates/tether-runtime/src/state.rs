//! Store data and the error seam between the bridge and `wasmi`.

use std::fmt;

use tether_bridge::Bridge;
use tether_types::{AbiNames, BridgeConfig, BridgeError, BridgeResult};
use thiserror::Error;
use wasmi::{AsContext, Instance, Memory, TypedFunc};

/// Data held by every guest's `wasmi::Store`.
pub struct HostState {
    pub bridge: Bridge,
    pub(crate) exports: Option<GuestExports>,
}

impl HostState {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            bridge: Bridge::new(config),
            exports: None,
        }
    }
}

impl fmt::Debug for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostState")
            .field("bridge", &self.bridge)
            .field("linked", &self.exports.is_some())
            .finish()
    }
}

/// Guest exports the bridge calls back into.
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<(i32, i32), i32>,
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub exn_store: Option<TypedFunc<i32, ()>>,
    pub invoke: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub destroy: Option<TypedFunc<(i32, i32, i32), ()>>,
}

impl GuestExports {
    /// Look up the bridge exports of a freshly started instance.
    pub fn resolve(
        ctx: impl AsContext,
        instance: &Instance,
        abi: &AbiNames,
    ) -> BridgeResult<Self> {
        let ctx = ctx.as_context();
        let memory = instance
            .get_memory(&ctx, &abi.memory)
            .ok_or_else(|| BridgeError::MissingExport(abi.memory.clone()))?;
        let malloc = instance
            .get_typed_func(&ctx, &abi.malloc)
            .map_err(|_| BridgeError::MissingExport(abi.malloc.clone()))?;
        Ok(Self {
            memory,
            malloc,
            realloc: instance.get_typed_func(&ctx, &abi.realloc).ok(),
            exn_store: instance.get_typed_func(&ctx, &abi.exn_store).ok(),
            invoke: instance.get_typed_func(&ctx, &abi.invoke).ok(),
            destroy: instance.get_typed_func(&ctx, &abi.destroy).ok(),
        })
    }
}

/// A bridge failure carried through guest frames as a `wasmi` host error.
#[derive(Debug, Clone, Error)]
pub(crate) enum GuestAbort {
    #[error("guest threw: {0}")]
    Throw(String),
    #[error("{0}")]
    Fault(String),
}

impl wasmi::core::HostError for GuestAbort {}

/// Abort the running guest call with `err`.
pub(crate) fn abort(err: BridgeError) -> wasmi::Error {
    let abort = match err {
        BridgeError::GuestThrow(message) => GuestAbort::Throw(message),
        other => GuestAbort::Fault(other.to_string()),
    };
    wasmi::Error::host(abort)
}

/// Convert a failed guest call back into a bridge error.
pub(crate) fn from_wasmi(err: wasmi::Error) -> BridgeError {
    match err.downcast_ref::<GuestAbort>() {
        Some(GuestAbort::Throw(message)) => BridgeError::GuestThrow(message.clone()),
        Some(GuestAbort::Fault(message)) => BridgeError::Guest(message.clone()),
        None => BridgeError::Guest(err.to_string()),
    }
}
