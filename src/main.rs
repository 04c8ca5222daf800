//! bsbot CLI: run the decision loop, inspect a screenshot, or fit a tile grid.

use anyhow::{bail, Context, Result};
use bs_capture::{Frame, FrameSource, ReplaySource};
use bs_data::{GridSample, Settings};
use bs_vision::{DetectionEngine, EngineTuning, TargetSpec, Template, TesseractRecognizer};
use bs_world::{CalibrationSample, PixelPoint, TileCoord, TileGrid};
use bsbot::input::DryRunSink;
use bsbot::Runtime;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bsbot")]
#[command(about = "Screen-reading combat automation core")]
#[command(version)]
struct Cli {
    /// Settings file (JSON). Missing means defaults.
    #[arg(long, global = true, default_value = "settings.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the decision loop against a replay directory or the live window.
    Run {
        /// Directory of PNG frames to replay instead of capturing the window.
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Start over when the replay runs out.
        #[arg(long = "loop")]
        looped: bool,

        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Run one detection over a screenshot and print the result as JSON.
    Detect {
        image: PathBuf,

        /// Word to look for. Defaults to the configured target word.
        #[arg(long)]
        word: Option<String>,

        /// Template image tried before text recognition.
        #[arg(long)]
        template: Option<PathBuf>,
    },

    /// Fit a tile grid from a JSON list of samples and report the error.
    CalibrateGrid {
        /// `[{"x":0.1,"y":0.2,"row":0,"col":0}, ...]`, positions as frame fractions.
        samples: PathBuf,

        #[arg(long, default_value_t = 1920)]
        width: u32,

        #[arg(long, default_value_t = 1080)]
        height: u32,
    },
}

fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = Settings::load(path)?;
    settings
        .apply_profiles()
        .context("Failed to apply target profiles")?;
    Ok(settings)
}

fn recognizer(settings: &Settings) -> Arc<TesseractRecognizer> {
    Arc::new(TesseractRecognizer::new(
        &settings.detection.tesseract_cmd,
        settings.tuning.ocr_scale,
    ))
}

fn frame_source(settings: &Settings, replay: Option<PathBuf>, looped: bool) -> Result<Box<dyn FrameSource>> {
    let dir = replay.or_else(|| settings.capture.replay_dir.clone());
    if let Some(dir) = dir {
        let source = ReplaySource::open(&dir, looped || settings.capture.replay_loop)?
            .with_region(settings.capture.region);
        return Ok(Box::new(source));
    }
    live_source(settings)
}

#[cfg(feature = "window")]
fn live_source(settings: &Settings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(bs_capture::WindowSource::new(
        settings.capture.window_titles.clone(),
        settings.capture.region,
    )))
}

#[cfg(not(feature = "window"))]
fn live_source(_settings: &Settings) -> Result<Box<dyn FrameSource>> {
    bail!("Live capture needs the `window` feature; pass --replay <dir> instead")
}

async fn run(settings: Settings, replay: Option<PathBuf>, looped: bool, seconds: Option<f64>) -> Result<()> {
    if !settings.dry_run {
        // Device input lives outside this crate
        warn!("dry_run is off but no live input backend is linked; inputs are only logged");
    }
    let source = frame_source(&settings, replay, looped)?;
    let recognizer = recognizer(&settings);
    let runtime = Runtime::start(settings, source, Box::new(DryRunSink::default()), recognizer)?;

    match seconds {
        Some(s) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(s.max(0.0))) => {
                    info!("Run time of {:.1}s elapsed", s);
                }
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            info!("Interrupted");
        }
    }

    runtime.stop();
    let status = runtime.snapshot();
    runtime.join().await?;
    info!(
        "{} cycles, {} errors, {} detections",
        status.cycles, status.errors, status.detections_total
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn detect(settings: &Settings, image: &Path, word: Option<String>, template: Option<PathBuf>) -> Result<()> {
    let img = image::open(image)
        .with_context(|| format!("Failed to open {}", image.display()))?
        .to_rgba8();
    let word = word.unwrap_or_else(|| settings.combat.target_word.clone());
    if word.trim().is_empty() && template.is_none() {
        bail!("Nothing to look for: pass --word or --template");
    }
    let template = match template {
        Some(path) => Some(Arc::new(Template::load(&path, "cli")?)),
        None => None,
    };

    let engine = DetectionEngine::new(recognizer(settings), EngineTuning::from(&settings.tuning));
    let frame = Frame::new(img, (0, 0), 0.0);
    let spec = TargetSpec::text("cli", &word).with_template(template);
    let detection = engine.detect(&frame, settings.detection.method, &spec);
    info!(
        "{} box(es) for '{}' via {:?}",
        detection.boxes.len(),
        word,
        detection.method
    );
    println!("{}", serde_json::to_string_pretty(&detection)?);
    Ok(())
}

fn calibrate_grid(path: &Path, width: u32, height: u32) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let samples: Vec<GridSample> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let points: Vec<CalibrationSample> = samples
        .iter()
        .map(|s| CalibrationSample {
            pixel: PixelPoint::new(s.x * width as f64, s.y * height as f64),
            tile: TileCoord::new(s.row, s.col),
        })
        .collect();
    let fit = TileGrid::calibrate(&points)?;
    info!(
        "Fitted {} samples: tile {:.2}px, rotation {:.2} deg, mean error {:.3}px, held-out {:.3}px",
        points.len(),
        fit.grid.tile_size,
        fit.grid.rotation_deg,
        fit.mean_error_px,
        fit.acceptance_error()
    );
    println!("{}", serde_json::to_string_pretty(&fit)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    bsbot::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            replay,
            looped,
            seconds,
        } => run(load_settings(&cli.config)?, replay, looped, seconds).await,
        Commands::Detect {
            image,
            word,
            template,
        } => detect(&load_settings(&cli.config)?, &image, word, template),
        Commands::CalibrateGrid {
            samples,
            width,
            height,
        } => calibrate_grid(&samples, width, height),
    }
}
