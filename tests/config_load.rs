use std::sync::Mutex;

use tempfile::NamedTempFile;

use motion_recorder::config::Settings;
use motion_recorder::DetectType;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MOTION_CAMERA_URL",
        "MOTION_CAMERA_NAME",
        "MOTION_RECORD_DIR",
        "MOTION_DETECT_TYPE",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_and_applies_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
        [camera]
        name = "driveway"
        url = "http://10.0.0.7:8080/?action=stream"
        fps = 10
        record_dir = "/srv/motion"
        detect_type = "cascade"

        [motion]
        start_threshold = 3.0
        stop_threshold = 0.5
        skip_frames = 8

        [cascade]
        cascade_file = "/models/cars.json"
        min_neighbors = 2
        "#,
    );

    std::env::set_var("MOTION_CAMERA_NAME", "garage");
    std::env::set_var("MOTION_DETECT_TYPE", "f");

    let cfg = Settings::load(Some(file.path())).expect("load config");

    assert_eq!(cfg.camera.name, "garage");
    assert_eq!(cfg.camera.url, "http://10.0.0.7:8080/?action=stream");
    assert_eq!(cfg.camera.fps, 10);
    assert_eq!(cfg.camera.record_dir.to_str(), Some("/srv/motion"));
    assert_eq!(cfg.detector.detect_type, DetectType::Face);
    assert_eq!(cfg.motion.start_threshold, 3.0);
    assert_eq!(cfg.motion.stop_threshold, 0.5);
    assert_eq!(cfg.motion.skip_frames, 8);
    assert_eq!(cfg.detector.cascade.search.min_neighbors, 2);

    let recorder = cfg.recorder_config(10);
    assert_eq!(recorder.camera_name, "garage");
    assert_eq!(recorder.stop_threshold, 0.5);

    clear_env();
}

#[test]
fn loads_json_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "camera": { "name": "lobby", "detect_type": "pedestrian", "mark": true },
            "pedestrian": { "model_path": "/models/people.json", "win_stride": [4, 8], "scale": 1.1 },
            "motion": { "blur_kernel_size": [3, 5], "alpha": 0.1 }
        }"#,
    );
    std::env::set_var("MOTION_RECORD_DIR", "/tmp/lobby");

    let cfg = Settings::load(Some(file.path())).expect("load config");
    assert_eq!(cfg.camera.name, "lobby");
    assert!(cfg.camera.mark);
    assert_eq!(cfg.camera.record_dir.to_str(), Some("/tmp/lobby"));
    assert_eq!(cfg.detector.detect_type, DetectType::Pedestrian);
    assert_eq!(cfg.detector.pedestrian.search.win_stride, (4, 8));
    assert_eq!(cfg.motion.detector.blur_kernel, (3, 5));
    assert_eq!(cfg.motion.detector.alpha, 0.1);

    clear_env();
}

#[test]
fn no_file_yields_defaults_with_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("MOTION_CAMERA_URL", "stub://yard");

    let cfg = Settings::load(None).expect("defaults");
    assert_eq!(cfg.camera.url, "stub://yard");
    assert_eq!(cfg.detector.detect_type, DetectType::Motion);
    assert_eq!(cfg.source_config().url, "stub://yard");

    clear_env();
}

#[test]
fn rejects_bad_env_and_bad_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MOTION_DETECT_TYPE", "thermal");
    assert!(Settings::load(None).is_err());
    clear_env();

    let file = write_config(".toml", "[camera\nname = ");
    assert!(Settings::load(Some(file.path())).is_err());

    let missing = std::path::Path::new("/nonexistent/motion.toml");
    assert!(Settings::load(Some(missing)).is_err());
}
