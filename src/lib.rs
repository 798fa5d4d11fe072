//! Motion Recorder
//!
//! Watches a live camera (MJPEG over HTTP or a local V4L2 device), measures motion
//! against an adaptive background model and records video segments around activity.
//!
//! # Architecture
//!
//! Frames flow through a single-threaded loop owned by [`Pipeline`]:
//!
//! 1. **Ingest**: a [`FrameSource`] yields decoded frames in arrival order.
//! 2. **Pre-roll**: a [`FrameRingBuffer`] holds one second of frames so segments
//!    include the moments before a trigger.
//! 3. **Motion**: [`MotionDetector`] blurs, accumulates a running-average background,
//!    thresholds the difference and returns the changed regions.
//! 4. **Secondary detection**: an optional [`SecondaryDetector`] (pedestrian, cascade
//!    or face) classifies those regions.
//! 5. **Recording**: [`Recorder`] opens, feeds and renames segments.
//!
//! # Module Structure
//!
//! - `config`: TOML/JSON settings with environment overrides
//! - `detect`: region classifiers and detection results
//! - `error`: stream error taxonomy
//! - `frame`: frames and the pre-roll buffer
//! - `ingest`: frame sources (MJPEG, V4L2, synthetic)
//! - `motion`: background model and region extraction
//! - `pipeline`: the capture loop
//! - `record`: segment state machine and video sinks

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod record;

pub use config::Settings;
pub use detect::{
    build_secondary, DetectType, DetectionKind, DetectionResult, MotionReport, Rect,
    SecondaryDetector,
};
pub use error::StreamError;
pub use frame::{Frame, FrameRingBuffer};
pub use ingest::{FrameSource, MjpegClient, SourceConfig, SourceInfo, StreamSource};
pub use motion::{MotionConfig, MotionDetector};
pub use pipeline::{Pipeline, PipelineStats, SamplingGate};
pub use record::{MjpegSinkFactory, Recorder, RecorderConfig, SinkFactory, VideoSink};
