use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{CascadeSettings, DetectType, DetectorSettings, PedestrianSettings};
use crate::detect::backends::{CascadeSearchConfig, HogSearchConfig};
use crate::ingest::{SourceConfig, DEFAULT_TIMEOUT};
use crate::motion::MotionConfig;
use crate::record::RecorderConfig;

const DEFAULT_CAMERA_NAME: &str = "camera";
const DEFAULT_CAMERA_URL: &str = "http://localhost:8080/?action=stream";
const DEFAULT_RESIZE_WIDTH_DIV: u32 = 320;
const DEFAULT_FPS_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_FPS: u32 = 5;
const DEFAULT_FOURCC: &str = "MJPG";
const DEFAULT_RECORD_EXT: &str = "mjpeg";
const DEFAULT_RECORD_DIR: &str = "~/motion/videos";
const DEFAULT_SAMPLING_DIVISOR: u32 = 4;
const DEFAULT_SKIP_FRAMES: u32 = 5;
const DEFAULT_START_THRESHOLD: f32 = 2.0;
const DEFAULT_STOP_THRESHOLD: f32 = 0.0;

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    camera: Option<CameraFile>,
    motion: Option<MotionFile>,
    pedestrian: Option<PedestrianFile>,
    cascade: Option<CascadeFile>,
    face: Option<CascadeFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFile {
    name: Option<String>,
    url: Option<String>,
    resize_width_div: Option<u32>,
    fps_interval: Option<f64>,
    fps: Option<u32>,
    fourcc: Option<String>,
    record_file_ext: Option<String>,
    record_dir: Option<PathBuf>,
    detect_type: Option<DetectType>,
    mark: Option<bool>,
    save_frames: Option<bool>,
    sampling_divisor: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionFile {
    blur_kernel_size: Option<[u32; 2]>,
    alpha: Option<f32>,
    black_threshold: Option<u8>,
    max_change: Option<f32>,
    skip_frames: Option<u32>,
    start_threshold: Option<f32>,
    stop_threshold: Option<f32>,
    dilate_iterations: Option<u8>,
    erode_iterations: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PedestrianFile {
    model_path: Option<PathBuf>,
    hit_threshold: Option<f32>,
    win_stride: Option<[u32; 2]>,
    padding: Option<[u32; 2]>,
    scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct CascadeFile {
    cascade_file: Option<PathBuf>,
    scale_factor: Option<f32>,
    min_neighbors: Option<u32>,
    min_width: Option<u32>,
    min_height: Option<u32>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub camera: CameraSettings,
    pub motion: MotionSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub name: String,
    pub url: String,
    /// Target detection width; frames are shrunk by `width / resize_width_div`.
    pub resize_width_div: u32,
    pub fps_interval: Duration,
    /// Frame rate used when the source cannot report one.
    pub fps: u32,
    pub fourcc: String,
    pub record_file_ext: String,
    pub record_dir: PathBuf,
    pub mark: bool,
    pub save_frames: bool,
    /// Analyse every `fps / sampling_divisor`-th frame.
    pub sampling_divisor: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub detector: MotionConfig,
    /// Frames skipped after a frame with motion at or above `max_change`.
    pub skip_frames: u32,
    pub start_threshold: f32,
    pub stop_threshold: f32,
}

impl Default for Settings {
    fn default() -> Self {
        // Every default is infallible; an empty file resolves to them.
        Self::from_file(SettingsFile::default())
    }
}

impl Settings {
    /// Read `path` (TOML, or JSON for `.json`), apply `MOTION_*` overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SettingsFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SettingsFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let pedestrian = file.pedestrian.unwrap_or_default();

        let motion_defaults = MotionConfig::default();
        let hog_defaults = HogSearchConfig::default();

        let camera_settings = CameraSettings {
            name: camera
                .name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            resize_width_div: camera.resize_width_div.unwrap_or(DEFAULT_RESIZE_WIDTH_DIV),
            fps_interval: Duration::from_secs_f64(
                camera
                    .fps_interval
                    .unwrap_or(DEFAULT_FPS_INTERVAL_SECS)
                    .max(0.0),
            ),
            fps: camera.fps.unwrap_or(DEFAULT_FPS),
            fourcc: camera
                .fourcc
                .unwrap_or_else(|| DEFAULT_FOURCC.to_string()),
            record_file_ext: camera
                .record_file_ext
                .unwrap_or_else(|| DEFAULT_RECORD_EXT.to_string()),
            record_dir: camera
                .record_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORD_DIR)),
            mark: camera.mark.unwrap_or(false),
            save_frames: camera.save_frames.unwrap_or(false),
            sampling_divisor: camera.sampling_divisor.unwrap_or(DEFAULT_SAMPLING_DIVISOR),
            timeout: camera
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
        };

        let motion_settings = MotionSettings {
            detector: MotionConfig {
                blur_kernel: motion
                    .blur_kernel_size
                    .map(|[w, h]| (w, h))
                    .unwrap_or(motion_defaults.blur_kernel),
                alpha: motion.alpha.unwrap_or(motion_defaults.alpha),
                black_threshold: motion
                    .black_threshold
                    .unwrap_or(motion_defaults.black_threshold),
                max_change: motion.max_change.unwrap_or(motion_defaults.max_change),
                dilate_iterations: motion
                    .dilate_iterations
                    .unwrap_or(motion_defaults.dilate_iterations),
                erode_iterations: motion
                    .erode_iterations
                    .unwrap_or(motion_defaults.erode_iterations),
            },
            skip_frames: motion.skip_frames.unwrap_or(DEFAULT_SKIP_FRAMES),
            start_threshold: motion.start_threshold.unwrap_or(DEFAULT_START_THRESHOLD),
            stop_threshold: motion.stop_threshold.unwrap_or(DEFAULT_STOP_THRESHOLD),
        };

        let detector = DetectorSettings {
            detect_type: camera.detect_type.unwrap_or_default(),
            pedestrian: PedestrianSettings {
                model_path: pedestrian.model_path,
                search: HogSearchConfig {
                    hit_threshold: pedestrian.hit_threshold.unwrap_or(hog_defaults.hit_threshold),
                    win_stride: pedestrian
                        .win_stride
                        .map(|[x, y]| (x, y))
                        .unwrap_or(hog_defaults.win_stride),
                    padding: pedestrian
                        .padding
                        .map(|[x, y]| (x, y))
                        .unwrap_or(hog_defaults.padding),
                    scale: pedestrian.scale.unwrap_or(hog_defaults.scale),
                },
            },
            cascade: cascade_settings(file.cascade, CascadeSettings::cascade_defaults()),
            face: cascade_settings(file.face, CascadeSettings::face_defaults()),
        };

        Self {
            camera: camera_settings,
            motion: motion_settings,
            detector,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("MOTION_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(name) = std::env::var("MOTION_CAMERA_NAME") {
            if !name.trim().is_empty() {
                self.camera.name = name;
            }
        }
        if let Ok(dir) = std::env::var("MOTION_RECORD_DIR") {
            if !dir.trim().is_empty() {
                self.camera.record_dir = PathBuf::from(dir);
            }
        }
        if let Ok(detect_type) = std::env::var("MOTION_DETECT_TYPE") {
            if !detect_type.trim().is_empty() {
                self.detector.detect_type = detect_type
                    .parse()
                    .context("MOTION_DETECT_TYPE")?;
            }
        }
        Ok(())
    }

    /// Check cross-field constraints. Run again after changing loaded settings.
    pub fn validate(&self) -> Result<()> {
        if self.camera.name.trim().is_empty() || self.camera.name.contains(['/', '\\']) {
            return Err(anyhow!(
                "camera.name must be a non-empty directory name, got '{}'",
                self.camera.name
            ));
        }
        if self.camera.url.trim().is_empty() {
            return Err(anyhow!("camera.url must not be empty"));
        }
        if self.camera.resize_width_div == 0 {
            return Err(anyhow!("camera.resize_width_div must be greater than zero"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera.fps must be greater than zero"));
        }
        if self.camera.record_file_ext.trim().is_empty() {
            return Err(anyhow!("camera.record_file_ext must not be empty"));
        }
        if self.camera.fourcc.len() != 4 {
            return Err(anyhow!(
                "camera.fourcc must be four characters, got '{}'",
                self.camera.fourcc
            ));
        }
        if self.camera.timeout.is_zero() {
            return Err(anyhow!("camera.timeout_secs must be greater than zero"));
        }
        self.motion.detector.validate().context("motion")?;
        if self.motion.stop_threshold > self.motion.start_threshold {
            return Err(anyhow!(
                "motion.stop_threshold ({}) must not exceed motion.start_threshold ({})",
                self.motion.stop_threshold,
                self.motion.start_threshold
            ));
        }
        if self.detector.pedestrian.search.scale <= 1.0 {
            return Err(anyhow!("pedestrian.scale must be greater than 1"));
        }
        let stride = self.detector.pedestrian.search.win_stride;
        if stride.0 == 0 || stride.1 == 0 {
            return Err(anyhow!("pedestrian.win_stride must be positive"));
        }
        for (section, cascade) in [("cascade", &self.detector.cascade), ("face", &self.detector.face)] {
            if cascade.search.scale_factor <= 1.0 {
                return Err(anyhow!("{}.scale_factor must be greater than 1", section));
            }
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.camera.url.clone(),
            fps: self.camera.fps,
            timeout: self.camera.timeout,
        }
    }

    /// Recorder settings; `fps` is the rate the source actually reports.
    pub fn recorder_config(&self, fps: u32) -> RecorderConfig {
        RecorderConfig {
            record_dir: self.camera.record_dir.clone(),
            camera_name: self.camera.name.clone(),
            file_ext: self.camera.record_file_ext.clone(),
            fourcc: self.camera.fourcc.clone(),
            fps,
            start_threshold: self.motion.start_threshold,
            stop_threshold: self.motion.stop_threshold,
        }
    }
}

fn cascade_settings(file: Option<CascadeFile>, defaults: CascadeSettings) -> CascadeSettings {
    let file = file.unwrap_or_default();
    CascadeSettings {
        cascade_file: file.cascade_file,
        search: CascadeSearchConfig {
            scale_factor: file.scale_factor.unwrap_or(defaults.search.scale_factor),
            min_neighbors: file.min_neighbors.unwrap_or(defaults.search.min_neighbors),
        },
        min_width: file.min_width.unwrap_or(defaults.min_width),
        min_height: file.min_height.unwrap_or(defaults.min_height),
    }
}

fn read_config_file(path: &Path) -> Result<SettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
