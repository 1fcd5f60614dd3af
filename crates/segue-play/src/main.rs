//! # Segue
//!
//! Plays audio files back to back without gaps.

mod session;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use segue_audio::host::output::list_output_devices;
use segue_audio::{CpalHost, Player};
use segue_core::EngineConfig;
use session::Session;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for segue
#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(about = "Gapless audio player")]
#[command(version)]
struct Args {
    /// Files to play, in order
    files: Vec<PathBuf>,

    /// Output volume (0.0 to 1.0)
    #[arg(short, long, env = "SEGUE_VOLUME")]
    volume: Option<f32>,

    /// Linear gain applied before volume
    #[arg(long)]
    pre_gain: Option<f32>,

    /// Clamp output to full scale
    #[arg(long)]
    hard_limit: bool,

    /// Output device name
    #[arg(short, long, env = "SEGUE_DEVICE")]
    device: Option<String>,

    /// Output sample rate; audio is resampled when it differs
    #[arg(short, long)]
    rate: Option<u32>,

    /// Start the first file at this many seconds
    #[arg(short, long)]
    start: Option<f64>,

    /// Engine tuning as JSON
    #[arg(short, long, env = "SEGUE_CONFIG")]
    config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue=info,segue_audio=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for device in list_output_devices()? {
            println!("{device}");
        }
        return Ok(());
    }
    if args.files.is_empty() {
        bail!("no files given");
    }

    info!("Starting Segue v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    let host = CpalHost::new().context("Failed to open audio output")?;
    let player = Player::new(Box::new(host), config).context("Failed to start player")?;

    if let Some(device) = &args.device {
        player
            .set_output_device_uid(device)
            .with_context(|| format!("Failed to select output device {device}"))?;
    }
    if let Some(rate) = args.rate {
        player
            .set_output_sample_rate(rate)
            .with_context(|| format!("Failed to run output at {rate} Hz"))?;
    }
    if let Some(volume) = args.volume {
        player.set_volume(volume)?;
    }
    if let Some(gain) = args.pre_gain {
        player.set_pre_gain(gain)?;
    }
    player.set_hard_limiting(args.hard_limit)?;

    let mut queued = 0;
    for path in &args.files {
        match player.enqueue_path(path) {
            Ok(()) => queued += 1,
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    if queued == 0 {
        bail!("none of the given files could be played");
    }
    info!("Queued {queued} of {} file(s)", args.files.len());

    let session = Session::new(player);
    session.start(args.start)?;
    session.run()
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
