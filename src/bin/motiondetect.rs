//! motiondetect - record video segments when a camera sees motion
//!
//! Reads settings from a TOML/JSON file (plus `MOTION_*` environment overrides),
//! connects to the camera and runs the capture loop until the stream ends or
//! Ctrl-C is pressed. The active segment is finalised either way.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use motion_recorder::{
    build_secondary, DetectType, MjpegSinkFactory, Pipeline, Settings, StreamSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Settings file (TOML, or JSON with a .json extension).
    #[arg(env = "MOTION_CONFIG")]
    config: Option<PathBuf>,
    /// Camera URL or device, overriding the settings file.
    #[arg(long)]
    url: Option<String>,
    /// Secondary detector: motion, pedestrian, cascade or face (m/p/h/f).
    #[arg(long)]
    detect: Option<String>,
    /// Draw motion and detection boxes into recorded frames.
    #[arg(long)]
    mark: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(url) = args.url {
        settings.camera.url = url;
    }
    if let Some(detect) = args.detect.as_deref() {
        settings.detector.detect_type = detect.parse::<DetectType>()?;
    }
    settings.camera.mark |= args.mark;
    settings.validate().context("command line overrides")?;

    log::info!(
        "motiondetect {} camera '{}' ({:?})",
        env!("CARGO_PKG_VERSION"),
        settings.camera.name,
        settings.detector.detect_type
    );

    let source = StreamSource::new(settings.source_config())?;
    let detector = build_secondary(&settings.detector)?;
    let mut pipeline = Pipeline::new(
        &settings,
        Box::new(source),
        detector,
        Box::new(MjpegSinkFactory),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let stats = pipeline
        .run(&shutdown)
        .with_context(|| format!("camera '{}'", settings.camera.name))?;
    log::info!(
        "processed {} frames ({} analysed), {} segments, {} detections",
        stats.frames,
        stats.sampled,
        stats.segments,
        stats.detections
    );
    Ok(())
}
