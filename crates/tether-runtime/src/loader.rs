//! Entry points: compile, link and instantiate a guest exactly once.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tether_types::{BridgeConfig, BridgeError, BridgeResult};
use tracing::{debug, warn};
use wasmi::{Config, Engine, Linker, Module, Store};

use crate::instance::GuestInstance;
use crate::intrinsics;
use crate::state::{GuestExports, HostState};

/// Where the asynchronous entry point gets its module from.
pub enum ModuleSource {
    /// Raw module bytes.
    Bytes(Vec<u8>),
    /// A file, read asynchronously.
    Path(PathBuf),
    /// A byte stream, compiled as it is read.
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Path(path) => write!(f, "Path({})", path.display()),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for ModuleSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

type ModuleDigest = [u8; 32];

fn digest(bytes: &[u8]) -> ModuleDigest {
    Sha256::digest(bytes).into()
}

fn hex(digest: &ModuleDigest) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn compile_err(err: impl fmt::Display) -> BridgeError {
    BridgeError::Compile(err.to_string())
}

/// Owns the engine, the linker with every intrinsic, and at most one guest.
pub struct Runtime {
    engine: Engine,
    linker: Linker<HostState>,
    config: BridgeConfig,
    guest: Option<GuestInstance>,
    digest: Option<ModuleDigest>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("initialised", &self.guest.is_some())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let mut engine_config = Config::default();
        engine_config.consume_fuel(config.fuel.is_some());
        let engine = Engine::new(&engine_config);
        let mut linker = Linker::new(&engine);
        intrinsics::link(&mut linker, &config.abi.import_module)?;
        Ok(Self {
            engine,
            linker,
            config,
            guest: None,
            digest: None,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The linker, for registering extra host imports before initialisation.
    pub fn linker_mut(&mut self) -> &mut Linker<HostState> {
        &mut self.linker
    }

    pub fn guest(&self) -> Option<&GuestInstance> {
        self.guest.as_ref()
    }

    pub fn guest_mut(&mut self) -> Option<&mut GuestInstance> {
        self.guest.as_mut()
    }

    /// Compile and instantiate `wasm`, or return the existing instance.
    pub fn init_sync(&mut self, wasm: &[u8]) -> BridgeResult<&mut GuestInstance> {
        let digest = digest(wasm);
        if self.guest.is_none() {
            let module = Module::new(&self.engine, wasm).map_err(compile_err)?;
            self.instantiate(&module, Some(digest))?;
        } else {
            self.already_initialised(Some(digest));
        }
        self.guest.as_mut().ok_or(BridgeError::NotInitialized)
    }

    /// Instantiate an already compiled module, or return the existing instance.
    pub fn init_sync_module(&mut self, module: &Module) -> BridgeResult<&mut GuestInstance> {
        if self.guest.is_none() {
            self.instantiate(module, None)?;
        } else {
            self.already_initialised(None);
        }
        self.guest.as_mut().ok_or(BridgeError::NotInitialized)
    }

    /// Load, compile and instantiate a module, or return the existing instance.
    pub async fn init(&mut self, source: impl Into<ModuleSource>) -> BridgeResult<&mut GuestInstance> {
        let source = source.into();
        if self.guest.is_some() {
            let digest = match &source {
                ModuleSource::Bytes(bytes) => Some(digest(bytes)),
                _ => None,
            };
            self.already_initialised(digest);
            return self.guest.as_mut().ok_or(BridgeError::NotInitialized);
        }

        let (module, digest) = match source {
            ModuleSource::Bytes(bytes) => {
                let module = Module::new(&self.engine, &bytes[..]).map_err(compile_err)?;
                (module, Some(digest(&bytes)))
            }
            ModuleSource::Path(path) => {
                debug!(path = %path.display(), "reading guest module");
                let bytes = tokio::fs::read(&path).await?;
                let module = Module::new(&self.engine, &bytes[..]).map_err(compile_err)?;
                (module, Some(digest(&bytes)))
            }
            ModuleSource::Reader(reader) => {
                let engine = self.engine.clone();
                let module = tokio::task::spawn_blocking(move || Module::new_streaming(&engine, reader))
                    .await
                    .map_err(compile_err)?
                    .map_err(compile_err)?;
                (module, None)
            }
        };
        self.instantiate(&module, digest)?;
        self.guest.as_mut().ok_or(BridgeError::NotInitialized)
    }

    fn already_initialised(&self, digest: Option<ModuleDigest>) {
        match (digest, self.digest) {
            (Some(new), Some(current)) if new != current => warn!(
                current = %hex(&current),
                ignored = %hex(&new),
                "guest already initialised; ignoring a different module"
            ),
            _ => debug!("guest already initialised"),
        }
    }

    fn instantiate(&mut self, module: &Module, digest: Option<ModuleDigest>) -> BridgeResult<()> {
        let mut store = Store::new(&self.engine, HostState::new(&self.config));
        if let Some(fuel) = self.config.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Instantiate(e.to_string()))?;
        }
        let instance = self
            .linker
            .instantiate(&mut store, module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|e| BridgeError::Instantiate(e.to_string()))?;
        let exports = GuestExports::resolve(&store, &instance, &self.config.abi)?;
        store.data_mut().exports = Some(exports);

        debug!(
            digest = %digest.as_ref().map(hex).unwrap_or_default(),
            fuel = ?self.config.fuel,
            "instantiated guest"
        );

        let mut guest = GuestInstance::new(store, instance, &self.config);
        guest.run_start()?;
        self.guest = Some(guest);
        self.digest = digest;
        Ok(())
    }
}
