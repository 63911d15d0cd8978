use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tether_runtime::{GuestInstance, Runtime};
use tether_types::{BridgeConfig, BridgeResult, Handle};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-run", about = "Load a guest module and run it against the host bridge")]
struct Cli {
    /// Guest module (`.wasm`).
    module: PathBuf,

    /// JSON bridge configuration; defaults apply to every omitted field.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export to call after the start export. It must take no arguments and
    /// return nothing or a handle.
    #[arg(short, long, value_name = "NAME")]
    invoke: Option<String>,

    /// Fuel per top-level call; overrides the config file.
    #[arg(long)]
    fuel: Option<u64>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if let Err(err) = builder.try_init() {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

/// Call `name`, printing the value behind the returned handle (if any).
fn invoke(guest: &mut GuestInstance, name: &str) -> BridgeResult<()> {
    let returns_handle = guest
        .instance()
        .get_func(guest.store(), name)
        .is_some_and(|func| func.ty(guest.store()).results().len() == 1);
    if returns_handle {
        let raw: i32 = guest.call(name, ())?;
        let value = guest.take(Handle::from_abi(raw))?;
        println!("{}", value.debug_string());
    } else {
        guest.call::<(), ()>(name, ())?;
    }
    Ok(())
}

async fn run(cli: Cli) -> BridgeResult<()> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    if cli.fuel.is_some() {
        config.fuel = cli.fuel;
    }

    let mut runtime = Runtime::new(config)?;
    let guest = runtime.init(cli.module.clone()).await?;
    info!(module = %cli.module.display(), memory = guest.memory_len(), "guest started");

    if let Some(name) = &cli.invoke {
        invoke(guest, name)?;
    }
    if let Some(exn) = guest.take_exception() {
        error!(%exn, "guest left an exception pending");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "tether-run failed");
            ExitCode::FAILURE
        }
    }
}
