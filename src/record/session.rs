use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use super::sink::{SinkFactory, VideoSink};
use crate::detect::DetectionKind;
use crate::error::StreamError;
use crate::frame::Frame;

/// Where and how segments are written, and when they start and stop.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderConfig {
    pub record_dir: PathBuf,
    pub camera_name: String,
    pub file_ext: String,
    pub fourcc: String,
    pub fps: u32,
    /// Sampled motion above this starts a segment.
    pub start_threshold: f32,
    /// Sampled motion at or below this ends a segment.
    pub stop_threshold: f32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_dir: PathBuf::from("~/motion/videos"),
            camera_name: "camera".to_string(),
            file_ext: "mjpeg".to_string(),
            fourcc: "MJPG".to_string(),
            fps: 5,
            start_threshold: 2.0,
            stop_threshold: 0.0,
        }
    }
}

/// Replace a leading `~/` with `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// `{record_dir}/{camera}/{YYYY-MM-DD}/{HH-MM-SS}.{ext}`
pub fn segment_path(config: &RecorderConfig, now: DateTime<Local>) -> PathBuf {
    expand_home(&config.record_dir)
        .join(&config.camera_name)
        .join(now.format("%Y-%m-%d").to_string())
        .join(format!("{}.{}", now.format("%H-%M-%S"), config.file_ext))
}

/// Secondary detections seen during one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FoundFlags {
    pub pedestrian: bool,
    pub cascade: bool,
    pub face: bool,
}

impl FoundFlags {
    pub fn set(&mut self, kind: DetectionKind) {
        match kind {
            DetectionKind::Pedestrian => self.pedestrian = true,
            DetectionKind::Cascade => self.cascade = true,
            DetectionKind::Face => self.face = true,
            DetectionKind::Motion => {}
        }
    }

    /// Highest-priority kind seen, `Motion` when none.
    pub fn winner(&self) -> DetectionKind {
        if self.pedestrian {
            DetectionKind::Pedestrian
        } else if self.cascade {
            DetectionKind::Cascade
        } else if self.face {
            DetectionKind::Face
        } else {
            DetectionKind::Motion
        }
    }
}

struct Session {
    path: PathBuf,
    sink: Box<dyn VideoSink>,
    started_at: DateTime<Local>,
    flags: FoundFlags,
    frames: u64,
}

/// Recording state machine: Idle while `session` is `None`, Recording otherwise.
pub struct Recorder {
    config: RecorderConfig,
    factory: Box<dyn SinkFactory>,
    session: Option<Session>,
    segments: u64,
}

impl Recorder {
    pub fn new(config: RecorderConfig, factory: Box<dyn SinkFactory>) -> Self {
        Self {
            config,
            factory,
            session: None,
            segments: 0,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn active_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    pub fn flags(&self) -> Option<FoundFlags> {
        self.session.as_ref().map(|s| s.flags)
    }

    /// Segments finished so far.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    pub fn should_start(&self, motion_percent: f32) -> bool {
        motion_percent > self.config.start_threshold
    }

    pub fn should_stop(&self, motion_percent: f32) -> bool {
        motion_percent <= self.config.stop_threshold
    }

    /// Open a new segment. While recording this returns the active path unchanged.
    pub fn start(&mut self, now: DateTime<Local>, size: (u32, u32)) -> Result<PathBuf> {
        if let Some(session) = &self.session {
            return Ok(session.path.clone());
        }
        let path = segment_path(&self.config, now);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StreamError::recording(format!("create {}: {}", dir.display(), e)))?;
        }
        let sink = self
            .factory
            .open(&path, &self.config.fourcc, self.config.fps, size)
            .map_err(|e| match StreamError::classify(&e) {
                Some(StreamError::Recording(_)) => e,
                _ => anyhow::Error::new(StreamError::recording(format!(
                    "open sink {}: {:#}",
                    path.display(),
                    e
                ))),
            })?;
        log::info!("Recorder: started {} ({}x{})", path.display(), size.0, size.1);
        self.session = Some(Session {
            path: path.clone(),
            sink,
            started_at: now,
            flags: FoundFlags::default(),
            frames: 0,
        });
        Ok(path)
    }

    /// Append a frame to the active segment. A failed write finalises the segment.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Err(err) = session.sink.write(frame) {
            let path = session.path.clone();
            if let Err(stop_err) = self.stop() {
                log::error!("Recorder: finalising {} after write failure: {:#}", path.display(), stop_err);
            }
            return Err(match StreamError::classify(&err) {
                Some(StreamError::Recording(_)) => err,
                _ => anyhow::Error::new(StreamError::recording(format!(
                    "write {}: {:#}",
                    path.display(),
                    err
                ))),
            });
        }
        session.frames += 1;
        Ok(())
    }

    pub fn flag(&mut self, kind: DetectionKind) {
        if let Some(session) = self.session.as_mut() {
            session.flags.set(kind);
        }
    }

    /// Close the sink and rename the file after the highest-priority detection.
    /// Returns the final path, or `None` when idle.
    pub fn stop(&mut self) -> Result<Option<PathBuf>> {
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        self.segments += 1;
        if let Err(err) = session.sink.close() {
            log::error!("Recorder: closing {}: {:#}", session.path.display(), err);
        }
        drop(session.sink);

        let tag = session.flags.winner().tag();
        let target = tagged_path(&session.path, tag);
        std::fs::rename(&session.path, &target).map_err(|e| {
            StreamError::recording(format!(
                "rename {} to {}: {}",
                session.path.display(),
                target.display(),
                e
            ))
        })?;
        let elapsed = Local::now().signed_duration_since(session.started_at);
        log::info!(
            "Recorder: stopped {} ({} frames, {}s)",
            target.display(),
            session.frames,
            elapsed.num_seconds()
        );
        Ok(Some(target))
    }

    /// Store one detection frame as `{dir}/{kind}-{stem}/{frame_number}.jpg`.
    pub fn save_snapshot(&self, kind: DetectionKind, frame_number: u64, jpeg: &[u8]) -> Result<PathBuf> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| StreamError::recording("no active segment for snapshot"))?;
        let dir = session.path.parent().unwrap_or_else(|| Path::new("."));
        let stem = session
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let snapshot_dir = dir.join(format!("{}-{}", kind.tag(), stem));
        std::fs::create_dir_all(&snapshot_dir)
            .with_context(|| format!("create {}", snapshot_dir.display()))?;
        let path = snapshot_dir.join(format!("{}.jpg", frame_number));
        std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Recorder: {:#}", err);
        }
    }
}

/// `{dir}/{tag}-{file}`, with a numeric suffix when that name is taken.
fn tagged_path(path: &Path, tag: &str) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let candidate = dir.join(format!("{}-{}", tag, name));
    if !candidate.exists() {
        return candidate;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    (1u32..)
        .map(|n| dir.join(format!("{}-{}-{}{}", tag, stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
