//! `wasmi` embedding of the tether bridge.
//!
//! [`Runtime`] compiles a guest module, links every intrinsic from
//! [`tether_types::abi::Intrinsic`] under the configured import module, and
//! instantiates the guest exactly once. The resulting [`GuestInstance`] owns
//! the store, whose [`HostState`] carries the [`tether_bridge::Bridge`].
//!
//! ```no_run
//! # async fn demo(wasm: Vec<u8>) -> tether_types::BridgeResult<()> {
//! use tether_runtime::Runtime;
//! use tether_types::BridgeConfig;
//!
//! let mut runtime = Runtime::new(BridgeConfig::default())?;
//! let guest = runtime.init(wasm).await?;
//! let answer: i32 = guest.call("main", ())?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

mod context;
pub mod instance;
pub mod intrinsics;
mod loader;
mod state;

pub use context::GuestContext;
pub use instance::GuestInstance;
pub use loader::{ModuleSource, Runtime};
pub use state::HostState;
