use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Local;
use image::{Rgb, RgbImage};

use motion_recorder::ingest::SourceStats;
use motion_recorder::{
    DetectionKind, DetectionResult, Frame, FrameSource, MjpegSinkFactory, Pipeline, Rect,
    SecondaryDetector, Settings, SinkFactory, SourceInfo, StreamError, VideoSink,
};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;
const SQUARE: u32 = 40;

// ----------------------------------------------------------------------------
// Scripted source
// ----------------------------------------------------------------------------

enum Ending {
    Exhausted,
    Broken,
}

struct ScriptedSource {
    frames: VecDeque<RgbImage>,
    ending: Ending,
    connected: bool,
    healthy: bool,
    served: u64,
}

impl ScriptedSource {
    fn new(frames: Vec<RgbImage>, ending: Ending) -> Self {
        Self {
            frames: frames.into(),
            ending,
            connected: false,
            healthy: true,
            served: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match self.frames.pop_front() {
            Some(image) => {
                self.served += 1;
                Ok(Frame::new(image, Local::now()))
            }
            None => match self.ending {
                Ending::Exhausted => Err(StreamError::SourceExhausted.into()),
                Ending::Broken => Err(anyhow::anyhow!("camera driver crashed")),
            },
        }
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: WIDTH,
            height: HEIGHT,
            fps: 4,
        }
    }

    fn is_healthy(&self) -> bool {
        self.connected && self.healthy
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.served,
            source: "scripted".to_string(),
        }
    }
}

fn background() -> RgbImage {
    RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([64, 64, 64]))
}

fn with_square(x: u32) -> RgbImage {
    let mut image = background();
    for py in 40..40 + SQUARE {
        for px in x..x + SQUARE {
            image.put_pixel(px, py, Rgb([230, 230, 230]));
        }
    }
    image
}

/// `quiet` static frames, `moving` frames with a sliding square, `quiet` static frames.
fn burst(quiet: usize, moving: u32) -> Vec<RgbImage> {
    let mut frames: Vec<RgbImage> = (0..quiet).map(|_| background()).collect();
    frames.extend((0..moving).map(|i| with_square(20 + i * 10)));
    frames.extend((0..quiet).map(|_| background()));
    frames
}

// ----------------------------------------------------------------------------
// In-memory sink
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SinkLog {
    opened: Vec<PathBuf>,
    frames: usize,
    closed: usize,
}

struct MemorySinkFactory(Arc<Mutex<SinkLog>>);

struct MemorySink(Arc<Mutex<SinkLog>>);

impl SinkFactory for MemorySinkFactory {
    fn open(&mut self, path: &Path, _fourcc: &str, _fps: u32, size: (u32, u32)) -> Result<Box<dyn VideoSink>> {
        assert_eq!(size, (WIDTH, HEIGHT));
        std::fs::write(path, b"")?;
        self.0.lock().unwrap().opened.push(path.to_path_buf());
        Ok(Box::new(MemorySink(self.0.clone())))
    }
}

impl VideoSink for MemorySink {
    fn write(&mut self, _frame: &Frame) -> Result<()> {
        self.0.lock().unwrap().frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.lock().unwrap().closed += 1;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Fake secondary detector
// ----------------------------------------------------------------------------

/// Reports every motion region as a pedestrian.
struct EverythingIsAPerson;

impl SecondaryDetector for EverythingIsAPerson {
    fn kind(&self) -> DetectionKind {
        DetectionKind::Pedestrian
    }

    fn min_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn detect(&mut self, regions: &[Rect], _image: &RgbImage) -> Vec<DetectionResult> {
        regions
            .iter()
            .filter_map(|roi| {
                Some(DetectionResult {
                    region: Rect::new(0, 0, roi.w, roi.h)?,
                    roi: *roi,
                    kind: DetectionKind::Pedestrian,
                    weight: Some(1.0),
                })
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn settings(record_dir: &Path, extra: &str) -> Settings {
    let raw = format!(
        r#"
        [camera]
        name = "test"
        url = "stub://scripted"
        resize_width_div = {WIDTH}
        sampling_divisor = 8
        record_dir = "{}"
        {extra}

        [motion]
        start_threshold = 2.0
        stop_threshold = 0.0
        "#,
        record_dir.display()
    );
    Settings::from_toml_str(&raw).expect("settings")
}

fn recorded_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[test]
fn motion_burst_records_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let source = ScriptedSource::new(burst(6, 3), Ending::Exhausted);
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(source),
        None,
        Box::new(MemorySinkFactory(log.clone())),
    )
    .unwrap();

    let stats = pipeline.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(stats.frames, 15);
    assert_eq!(stats.sampled, 15);
    assert_eq!(stats.segments, 1);

    let log = log.lock().unwrap();
    assert_eq!(log.opened.len(), 1);
    assert_eq!(log.closed, 1);
    assert!(log.frames >= 3, "wrote {} frames", log.frames);

    let files = recorded_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(file_name(&files[0]).starts_with("motion-"));
    assert!(files[0].starts_with(dir.path().join("test")));
}

#[test]
fn static_clip_never_records() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let frames = (0..30).map(|_| background()).collect();
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(ScriptedSource::new(frames, Ending::Exhausted)),
        None,
        Box::new(MemorySinkFactory(log.clone())),
    )
    .unwrap();

    let stats = pipeline.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(stats.frames, 30);
    assert_eq!(stats.segments, 0);
    // One second of pre-roll at 4 fps, never more.
    assert_eq!(stats.peak_preroll_bytes, 4 * (WIDTH * HEIGHT * 3) as usize);
    assert!(log.lock().unwrap().opened.is_empty());
    assert!(recorded_files(dir.path()).is_empty());
}

#[test]
fn separate_bursts_record_separate_segments() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let mut frames = burst(4, 2);
    frames.extend(burst(4, 2));
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(ScriptedSource::new(frames, Ending::Exhausted)),
        None,
        Box::new(MemorySinkFactory(log.clone())),
    )
    .unwrap();

    let stats = pipeline.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(stats.segments, 2);
    assert_eq!(log.lock().unwrap().opened.len(), 2);
    let files = recorded_files(dir.path());
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| file_name(f).starts_with("motion-")));
}

#[test]
fn secondary_hits_rename_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), "mark = true\nsave_frames = true"),
        Box::new(ScriptedSource::new(burst(4, 3), Ending::Exhausted)),
        Some(Box::new(EverythingIsAPerson)),
        Box::new(MemorySinkFactory(log)),
    )
    .unwrap();

    let stats = pipeline.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(stats.segments, 1);
    assert!(stats.detections > 0);

    let files = recorded_files(dir.path());
    let videos: Vec<_> = files
        .iter()
        .filter(|f| f.extension().is_some_and(|e| e == "mjpeg"))
        .collect();
    assert_eq!(videos.len(), 1);
    assert!(file_name(videos[0]).starts_with("pedestrian-"));

    let snapshots: Vec<_> = files
        .iter()
        .filter(|f| f.extension().is_some_and(|e| e == "jpg"))
        .collect();
    assert!(!snapshots.is_empty());
    for snapshot in snapshots {
        let parent = file_name(snapshot.parent().unwrap());
        assert!(parent.starts_with("pedestrian-"), "snapshot dir {}", parent);
        let bytes = std::fs::read(snapshot).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}

#[test]
fn source_failure_finalises_segment_and_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let mut frames = burst(4, 3);
    frames.truncate(6);
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(ScriptedSource::new(frames, Ending::Broken)),
        None,
        Box::new(MemorySinkFactory(log.clone())),
    )
    .unwrap();

    let err = pipeline.run(&AtomicBool::new(false)).unwrap_err();
    assert!(err.to_string().contains("camera driver crashed"));
    assert_eq!(log.lock().unwrap().closed, 1);
    let files = recorded_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(file_name(&files[0]).starts_with("motion-"));
}

#[test]
fn shutdown_flag_stops_before_reading() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(ScriptedSource::new(burst(2, 2), Ending::Exhausted)),
        None,
        Box::new(MemorySinkFactory(Arc::default())),
    )
    .unwrap();

    let stats = pipeline.run(&AtomicBool::new(true)).unwrap();
    assert_eq!(stats.frames, 0);
    assert!(pipeline.run(&AtomicBool::new(false)).is_err(), "a pipeline runs once");
}

#[test]
fn unhealthy_source_is_rejected_after_connect() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ScriptedSource::new(burst(2, 2), Ending::Exhausted);
    source.healthy = false;
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(source),
        None,
        Box::new(MemorySinkFactory(Arc::default())),
    )
    .unwrap();

    let err = pipeline.run(&AtomicBool::new(false)).unwrap_err();
    assert!(err.to_string().contains("not healthy"), "{:#}", err);
}

#[test]
fn writes_real_mjpeg_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new(
        &settings(dir.path(), ""),
        Box::new(ScriptedSource::new(burst(4, 3), Ending::Exhausted)),
        None,
        Box::new(MjpegSinkFactory),
    )
    .unwrap();

    pipeline.run(&AtomicBool::new(false)).unwrap();
    let files = recorded_files(dir.path());
    assert_eq!(files.len(), 1);
    let bytes = std::fs::read(&files[0]).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    let first_end = bytes
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .expect("end of first image")
        + 2;
    assert!(first_end < bytes.len(), "expected several frames");
    let decoded = image::load_from_memory(&bytes[..first_end]).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (WIDTH, HEIGHT));
}
