use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use blobserver_core::config;
use blobserver_core::runtime::App;
use blobserver_core::server;
use blobserver_core::shm;
use blobserver_core::video::GrayFrame;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "blobserver",
    about = "Real-time blob detection server, sends blobs through OSC",
    long_about = None,
    disable_version_flag = true
)]
struct Cli {
    /// Show the version of this software
    #[arg(short = 'v', long)]
    version: bool,

    /// Configuration file to load at startup
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Hide the camera preview
    #[arg(short = 'H', long)]
    hide: bool,

    /// Output detection values to the log
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Mask applied to all detectors
    #[arg(short = 'm', long)]
    mask: Option<PathBuf>,

    /// Use TCP instead of UDP for message transmission
    #[arg(short = 't', long)]
    tcp: bool,
}

/// Pacing of the main detection loop.
const CYCLE_INTERVAL: Duration = Duration::from_millis(16);

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("blobserver {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Respect RUST_LOG; default to info, or debug with --verbose
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("cleaning up shared memory in /tmp");
    shm::clean_stale_outputs();

    let app = Arc::new(App::new(cli.tcp));

    if let Some(path) = &cli.mask {
        let mask = load_mask(path)
            .with_context(|| format!("failed to load mask image {}", path.display()))?;
        info!(path = %path.display(), width = mask.width, height = mask.height, "global mask loaded");
        *app.mask.lock().expect("mask lock poisoned") = Some(mask);
    }

    // Bind failure here is fatal: without the control plane there is nothing
    // to serve.
    let server_thread = server::spawn(Arc::clone(&app), server::SERVER_PORT)
        .context("failed to start the OSC control server")?;

    // The configuration file issues the same requests a remote client would,
    // so it loads concurrently with the server.
    if let Some(path) = cli.config.clone() {
        let app = Arc::clone(&app);
        std::thread::spawn(move || match config::load(&path) {
            Ok(parsed) => config::apply(&app, &parsed),
            Err(err) => warn!(error = %err, "configuration not loaded"),
        });
    }

    let grab_thread = {
        let app = Arc::clone(&app);
        std::thread::spawn(move || app.run_grab_loop())
    };

    spawn_key_watcher(Arc::clone(&app));

    info!("blobserver running; press Escape or 'q' to quit");
    let mut cycle = 0u64;
    while app.is_running() {
        let display = app.process_cycle();

        if !cli.hide && cycle % 300 == 0 {
            let names: Vec<&str> = display.iter().map(|(name, _)| name.as_str()).collect();
            debug!(buffers = ?names, "display buffers");
        }

        cycle += 1;
        std::thread::sleep(CYCLE_INTERVAL);
    }

    grab_thread
        .join()
        .map_err(|_| anyhow::anyhow!("grab thread panicked"))?;
    server_thread
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?;

    info!("clean shutdown");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load_mask(path: &PathBuf) -> Result<GrayFrame> {
    let img = image::open(path)?.into_luma8();
    Ok(GrayFrame {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    })
}

/// The preview window is external; quitting by key still works by watching
/// stdin for Escape or 'q'.
fn spawn_key_watcher(app: Arc<App>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        loop {
            match stdin.read(&mut byte) {
                Ok(0) => break, // stdin closed; rely on signals instead
                Ok(_) if byte[0] == 0x1b || byte[0] == b'q' => {
                    info!("quit requested");
                    app.stop();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}
