use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_output_engine::engine::decoder::{AudioDecoder, SymphoniaDecoder};
use audio_output_engine::engine::output::CpalHost;
use audio_output_engine::{EngineConfig, OutputSession, PipelineEvent, Player};

/// Play an audio file through the synchronized output pipeline
#[derive(Parser, Debug)]
#[command(name = "aout-play")]
#[command(version)]
struct Args {
    /// Audio file to play
    path: PathBuf,

    /// Engine configuration (TOML)
    #[arg(short, long, env = "AOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Output device name; the system default when omitted
    #[arg(short, long, env = "AOUT_DEVICE")]
    device: Option<String>,

    /// Volume in percent
    #[arg(long, default_value = "100")]
    volume: u8,

    /// Start position in seconds
    #[arg(long)]
    start: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_output_engine=info,aout_play=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let host = Arc::new(CpalHost::new(args.device.clone()));
    let session = Arc::new(
        OutputSession::open(host, config).context("Failed to open output session")?,
    );
    let events = session.events();

    let decoder = SymphoniaDecoder::open(&args.path)
        .with_context(|| format!("Failed to open {}", args.path.display()))?;
    let duration = decoder.duration();
    info!(
        "Loaded {} ({}, {})",
        args.path.display(),
        decoder.format(),
        duration.map_or("unknown length".to_string(), |d| format!("{d:.1}s"))
    );

    let mut player = Player::new(session.clone(), args.volume);
    player.play(Box::new(decoder)).context("Failed to start playback")?;
    if let Some(start) = args.start {
        player.seek(start);
    }

    while player.is_decoding() {
        thread::sleep(Duration::from_secs(1));

        if let Err(e) = session.check_output() {
            warn!("Output unavailable: {}", e);
        }
        for event in events.try_iter() {
            match event {
                PipelineEvent::Underrun { start, end } => {
                    warn!("Underrun [{}us, {}us)", start, end)
                }
                other => info!("{:?}", other),
            }
        }

        let rate = session.sink_format().map_or(0, |f| f.rate);
        if rate > 0 {
            let secs = player.frames_submitted() as f64 / rate as f64;
            println!("\rSubmitted {:.2} seconds", secs);
        }
    }

    if let Err(e) = player.wait() {
        warn!("Playback ended with error: {}", e);
    }
    let stats = session.stats();
    session.close();
    info!(
        "Finished: {} buffers played, {} underruns, {} resyncs",
        stats.played, stats.underruns, stats.resyncs
    );
    Ok(())
}
