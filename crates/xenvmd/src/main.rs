//! XenVM volume-group metadata daemon (xenvmd).
//!
//! One xenvmd instance owns the authoritative LVM metadata of a volume
//! group shared by many hosts over a SAN. It serves JSON-RPC requests for
//! LV and host-lifecycle operations, runs the free-pool controller that
//! keeps per-host extent reservoirs topped up, and journals every extent
//! grant so that a crash never loses or double-allocates space.
//!
//! Usage:
//!   xenvmd --config /etc/xenvmd.conf [--port N] [--path SOCK] [--daemon]
//!
//! Startup is sequential: open the PVs, open the VG, bootstrap the journal
//! LV, replay the journal, then spawn the controller and the listeners.

mod config;
mod daemon;
mod freepool;
mod hosts;
mod rpc;
#[cfg(test)]
mod testutil;
mod vgstore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use xenvm_core::dev::{BlockDev, FileDev};
use xenvm_core::journal::Journal;

use crate::config::Config;
use crate::daemon::{reserved_lv_extents, Daemon, SharedDaemon, JOURNAL_LV};
use crate::freepool::FreePoolApply;
use crate::hosts::HostRegistry;
use crate::vgstore::{new_lv_op, VgStore};

/// XenVM volume-group metadata daemon
#[derive(Parser, Debug)]
#[command(name = "xenvmd", version, about = "XenVM volume-group metadata daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/xenvmd.conf")]
    config: PathBuf,

    /// Override the TCP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the Unix-domain socket path
    #[arg(long)]
    path: Option<String>,

    /// Detach from the terminal once the listener is ready
    #[arg(short, long)]
    daemon: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match Config::from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.listen_port = Some(port);
    }
    if let Some(path) = args.path {
        config.listen_path = Some(path);
    }
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    if args.daemon {
        daemonize(&config);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    info!("xenvmd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut devices: Vec<(String, Arc<dyn BlockDev>)> = Vec::new();
    for path in &config.devices {
        match FileDev::open(Path::new(path), 0) {
            Ok(dev) => devices.push((path.clone(), Arc::new(dev) as Arc<dyn BlockDev>)),
            Err(e) => {
                error!("cannot open device {path}: {e}");
                return 1;
            }
        }
    }

    let vg = match VgStore::open(devices) {
        Ok(vg) => Arc::new(vg),
        Err(e) => {
            error!("cannot open VG: {e}");
            return 1;
        }
    };
    {
        let name = vg.read(|vg| vg.name.clone()).await;
        if name != config.vg {
            error!("devices hold VG {name}, configuration expects {}", config.vg);
            return 1;
        }
    }

    if let Err(e) = ensure_journal_lv(&vg).await {
        error!("cannot bootstrap journal LV: {e}");
        return 1;
    }

    let hosts = HostRegistry::new(vg.clone(), config.retry_interval());
    let applier = Arc::new(FreePoolApply::new(
        vg.clone(),
        hosts.clone(),
        config.retry_interval(),
    ));
    let journal = {
        let jdev = match vg.open_lv_device(JOURNAL_LV).await {
            Ok(dev) => dev,
            Err(e) => {
                error!("cannot open journal LV: {e}");
                return 1;
            }
        };
        match Journal::start(jdev, JOURNAL_LV, applier, config.retry_interval()).await {
            Ok(journal) => journal,
            Err(e) => {
                error!("cannot start journal: {e}");
                return 1;
            }
        }
    };

    let daemon: SharedDaemon = Arc::new(Daemon {
        config: config.clone(),
        vg,
        journal,
        hosts,
        shutdown: Arc::new(Notify::new()),
    });

    tokio::spawn(freepool::run(daemon.clone()));

    let app = rpc::router(daemon.clone());
    if let Some(port) = config.listen_port {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("cannot listen on port {port}: {e}");
                return 1;
            }
        };
        info!("listening on 0.0.0.0:{port}");
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("TCP server failed: {e}");
            }
        });
    }
    let mut pidfile = None;
    if let Some(path) = &config.listen_path {
        let _ = std::fs::remove_file(path);
        let listener = match tokio::net::UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) => {
                error!("cannot listen on {path}: {e}");
                return 1;
            }
        };
        info!("listening on {path}");
        pidfile = match write_pidfile(path) {
            Ok(pidfile) => Some(pidfile),
            Err(e) => {
                error!("cannot write pidfile: {e}");
                return 1;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Unix-socket server failed: {e}");
            }
        });
    }

    info!("xenvmd ready");

    tokio::select! {
        _ = daemon.shutdown.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    if let Err(e) = daemon.hosts.shutdown().await {
        warn!("host shutdown failed: {e}");
    }
    daemon.journal.shutdown().await;
    if let Some(pidfile) = pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("xenvmd stopped");
    0
}

/// Create the daemon's journal LV on first start.
async fn ensure_journal_lv(vg: &Arc<VgStore>) -> xenvm_proto::XvResult<()> {
    if vg.read(|vg| vg.lv_by_name(JOURNAL_LV).is_some()).await {
        return Ok(());
    }
    info!("creating journal LV {JOURNAL_LV}");
    vg.write(|vg| new_lv_op(vg, JOURNAL_LV, reserved_lv_extents(vg)))
        .await?;
    vg.sync().await
}

fn write_pidfile(listen_path: &str) -> std::io::Result<PathBuf> {
    let path = PathBuf::from(format!("{listen_path}.lock"));
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

/// Fork; the child detaches and serves, the parent waits up to 30 s for
/// the child to accept a connection on the configured endpoint and exits
/// with the outcome.
fn daemonize(config: &Config) {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            for _ in 0..30 {
                std::thread::sleep(Duration::from_secs(1));
                if endpoint_accepts(config) {
                    std::process::exit(0);
                }
            }
            eprintln!("xenvmd: daemon did not start listening within 30s");
            std::process::exit(1);
        }
        Ok(ForkResult::Child) => {
            if let Err(e) = setsid() {
                eprintln!("xenvmd: setsid failed: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("xenvmd: fork failed: {e}");
            std::process::exit(1);
        }
    }
}

fn endpoint_accepts(config: &Config) -> bool {
    if let Some(port) = config.listen_port {
        return std::net::TcpStream::connect(("127.0.0.1", port)).is_ok();
    }
    if let Some(path) = &config.listen_path {
        return std::os::unix::net::UnixStream::connect(path).is_ok();
    }
    false
}
