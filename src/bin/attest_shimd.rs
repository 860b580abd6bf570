//! attest-shimd - attestation interception daemon
//!
//! This daemon:
//! 1. Loads the runtime configuration and keeps it fresh
//! 2. Attaches to the hook in the keystore process (bounded retries)
//! 3. Answers intercepted calls until the hook goes away
//!
//! Exit status 1 means the hook never came up; 0 means it went away and the
//! supervisor should restart us.

use anyhow::Result;
use clap::Parser;
use std::net::Shutdown;
use std::path::PathBuf;
use std::sync::Arc;

use attest_shim::{
    config::DaemonConfig,
    forge::{seed::SEED_FILE, Forge, SoftwareForge},
    policy::{PackagesListResolver, PolicyEngine},
    transport::{bootstrap, HookConnection},
    watcher::ConfigWatcher,
    Dispatcher, SnapshotCell,
};

#[derive(Parser, Debug)]
#[command(name = "attest-shimd", version, about = "Keystore attestation interception daemon")]
struct Args {
    /// JSON daemon configuration.
    #[arg(long, env = "ATTEST_SHIM_CONFIG")]
    config: Option<PathBuf>,
    /// Socket the hook listens on.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Directory holding target.txt and the mode flag files.
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = DaemonConfig::load_from(args.config.as_deref())?;
    if let Some(dir) = args.config_dir {
        cfg.config_dir = dir;
    }
    if let Some(socket) = args.socket {
        cfg.socket_override = Some(socket);
    }
    log::info!(
        "attest-shimd {} starting, config dir {}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_dir.display()
    );

    let snapshots = Arc::new(SnapshotCell::default());
    let watcher = ConfigWatcher::new(&cfg.config_dir, snapshots.clone(), cfg.poll_interval);
    if let Err(err) = watcher.reload() {
        log::error!("initial config load failed, starting with defaults: {}", err);
    }

    let forge: Arc<dyn Forge> = match SoftwareForge::load_or_create(cfg.runtime_file(SEED_FILE)) {
        Ok(forge) => Arc::new(forge),
        Err(err) => {
            log::error!("issuing seed unavailable, forging disabled: {}", err);
            Arc::new(SoftwareForge::unloaded())
        }
    };
    let resolver = Arc::new(PackagesListResolver::new(&cfg.packages_list));
    let policy = Arc::new(PolicyEngine::new(snapshots, resolver));
    let dispatcher = Dispatcher::new(policy.clone(), forge, cfg.caches);

    let connection = match bootstrap(cfg.bootstrap.attempts, cfg.bootstrap.delay, |_| {
        HookConnection::connect(&cfg.socket_path())
    }) {
        Ok(connection) => connection,
        Err(err) => {
            log::error!("{}, exiting", err);
            std::process::exit(1);
        }
    };
    for (handle, kind) in &connection.announcement().targets {
        dispatcher.register_target(*handle, *kind);
    }
    policy.set_hardware_broken_detected(!connection.announcement().has_tee());

    let watcher_handle = watcher.spawn();
    let closer = connection.try_clone_stream()?;
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, closing hook connection");
        let _ = closer.shutdown(Shutdown::Both);
    })?;

    let outcome = connection.serve(&dispatcher, cfg.workers)?;
    log::info!("stopped serving: {:?}", outcome);
    watcher_handle.stop()?;
    Ok(())
}
