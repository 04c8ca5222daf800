//! CLI tool to run a saved screenshot through the detection engine.
//! Usage: cargo run -p bs-vision --features cli --bin analyze_frame -- <screenshot.png> <word> [template.png]

use anyhow::{Context, Result};
use bs_capture::{crop_region, regions, Frame};
use bs_vision::{
    DetectionEngine, EngineTuning, MethodHint, NeedleEstimator, TargetSpec, Template,
    TesseractRecognizer,
};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <screenshot.png> <word> [template.png]", args[0]);
        std::process::exit(1);
    }

    let input_path = PathBuf::from(&args[1]);
    let img = image::open(&input_path)
        .with_context(|| format!("Failed to open {}", input_path.display()))?
        .to_rgba8();
    println!("Image size: {}x{}", img.width(), img.height());

    let template = match args.get(3) {
        Some(path) => Some(Arc::new(Template::load(&PathBuf::from(path), "cli")?)),
        None => None,
    };

    let needle = NeedleEstimator::default().estimate(&crop_region(&img, &regions::compass()));
    match needle {
        Some(angle) => println!("Compass needle: {:.1} deg", angle),
        None => println!("Compass needle: NOT FOUND"),
    }

    let engine = DetectionEngine::new(
        Arc::new(TesseractRecognizer::new("tesseract", 1.5)),
        EngineTuning::default(),
    );
    let frame = Frame::new(img, (0, 0), 0.0);
    let spec = TargetSpec::text("cli", &args[2]).with_template(template);

    for hint in [MethodHint::Auto, MethodHint::Template, MethodHint::Text] {
        let detection = engine.detect(&frame, hint, &spec);
        println!("\n=== {:?} ===", hint);
        println!("{}", serde_json::to_string_pretty(&detection)?);
    }

    Ok(())
}
