use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use turbo_bridge_core::{
    sine_block, BridgeConfig, ColorBuffer, FrameOutcome, FrameScheduler, RhaiScript,
    SpectrumAnalyzer,
};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_LEN: usize = 1024;
const DEFAULT_LEDS: usize = 8;

fn main() -> turbo_bridge_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            frames,
            leds,
            config,
            frequency,
        } => run_script(&script, frames, leds, config.as_deref(), frequency),
        Commands::Check { script } => check_script(&script),
    }
}

fn run_script(
    script: &Path,
    frames: u64,
    leds: Option<usize>,
    config: Option<&Path>,
    frequency: f32,
) -> turbo_bridge_core::Result<()> {
    let config = match config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    let led_count = match leds.unwrap_or(config.buffer.led_count) {
        0 => DEFAULT_LEDS,
        count => count,
    };
    tracing::info!(?script, frames, led_count, frequency, "running script");

    let effect = RhaiScript::from_path(script, &config.script, config.channels)?;
    let mut colors = ColorBuffer::with_len(led_count, config.channels);
    let mut analyzer = SpectrumAnalyzer::with_sample_rate(SAMPLE_RATE);
    let mut scheduler = FrameScheduler::new(effect, config);

    for frame in 0..frames {
        let offset = frame as usize * BLOCK_LEN;
        let samples = sine_block(frequency, SAMPLE_RATE, offset, BLOCK_LEN);
        let snapshot = analyzer.process_block(&samples)?;

        let report = scheduler.run_frame(snapshot, &mut colors);
        let preview: Vec<String> = colors.iter().take(4).map(|c| c.to_string()).collect();
        match &report.outcome {
            FrameOutcome::Committed(_) => tracing::info!(
                frame = report.frame,
                len = report.buffer_len,
                elapsed = ?report.elapsed,
                "pixels: {}",
                preview.join(" ")
            ),
            outcome => tracing::warn!(
                frame = report.frame,
                kind = outcome.kind(),
                "frame kept previous pixels"
            ),
        }
    }

    let stats = scheduler.stats();
    tracing::info!(
        committed = stats.committed,
        faulted = stats.faulted,
        timed_out = stats.timed_out,
        clamped = stats.clamped_channels,
        "finished"
    );
    scheduler.shutdown()
}

fn check_script(script: &Path) -> turbo_bridge_core::Result<()> {
    let config = BridgeConfig::default();
    let effect = RhaiScript::from_path(script, &config.script, config.channels)?;
    tracing::info!(arity = effect.arity(), "script compiled");

    match effect.call_helper("example")? {
        Some(value) => println!("example() = {value}"),
        None => tracing::info!("script defines no example() helper"),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs LED effect scripts against a synthetic spectrum", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a script for a number of frames using a generated sine tone.
    Run {
        /// Path to the `.rhai` effect script.
        script: PathBuf,
        /// Number of frames to run.
        #[arg(short, long, default_value_t = 60)]
        frames: u64,
        /// LED count; overrides the config file.
        #[arg(short, long)]
        leds: Option<usize>,
        /// Optional JSON bridge configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Frequency of the synthetic tone in Hz.
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,
    },
    /// Compile a script and evaluate its `example()` helper if present.
    Check {
        /// Path to the `.rhai` effect script.
        script: PathBuf,
    },
}
