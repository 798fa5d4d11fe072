//! Recording segments.
//!
//! `Recorder` is the Idle/Recording state machine: it opens one segment per burst of
//! activity, appends pre-roll frames to it, and on stop renames the file after the
//! most important detection seen (`pedestrian-`, `cascade-`, `face-` or `motion-`).
//! Sinks are pluggable through `SinkFactory`; `MjpegSinkFactory` is built in.

mod session;
mod sink;

pub use session::{expand_home, segment_path, FoundFlags, Recorder, RecorderConfig};
pub use sink::{encode_jpeg, frame_jpeg, MjpegFileSink, MjpegSinkFactory, SinkFactory, VideoSink};
