//! Bridge configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! { "initial_capacity": 128, "fuel": 1000000, "abi": { "malloc": "my_malloc" } }
//! ```

use crate::BridgeResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Handle-table slots reserved up front (the table still grows on demand).
    pub initial_capacity: usize,
    /// Use the ASCII fast path when encoding strings, if the guest exports a reallocator.
    pub string_fast_path: bool,
    /// Fuel given to the guest before each top-level call; `None` disables metering.
    pub fuel: Option<u64>,
    /// Drain pending closure finalizers after every top-level guest call.
    pub run_finalizers_after_calls: bool,
    /// Import module and export names of the guest ABI.
    pub abi: AbiNames,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 128,
            string_fast_path: true,
            fuel: None,
            run_finalizers_after_calls: true,
            abi: AbiNames::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Names that tie a guest module to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiNames {
    /// Import module under which the intrinsics are linked.
    pub import_module: String,
    pub memory: String,
    pub malloc: String,
    pub realloc: String,
    pub free: String,
    pub exn_store: String,
    pub invoke: String,
    pub destroy: String,
    pub start: String,
}

impl Default for AbiNames {
    fn default() -> Self {
        Self {
            import_module: crate::abi::IMPORT_MODULE.to_string(),
            memory: "memory".to_string(),
            malloc: "__tether_malloc".to_string(),
            realloc: "__tether_realloc".to_string(),
            free: "__tether_free".to_string(),
            exn_store: "__tether_exn_store".to_string(),
            invoke: "__tether_invoke".to_string(),
            destroy: "__tether_destroy".to_string(),
            start: "__tether_start".to_string(),
        }
    }
}
