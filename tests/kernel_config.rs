use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use faceflow_kernel::config::MAX_DIGITAL_ZOOM;
use faceflow_kernel::detect::{LivenessType, PerformanceMode};
use faceflow_kernel::{KernelConfig, LensFacing};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACEFLOW_CONFIG",
        "FACEFLOW_DB_PATH",
        "FACEFLOW_DATA_DIR",
        "FACEFLOW_CAMERA_FACING",
        "FACEFLOW_VERIFY_THRESHOLD",
        "FACEFLOW_SEARCH_THRESHOLD",
        "FACEFLOW_RETRY_LIMIT",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_load_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = KernelConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "faceflow.db");
    assert_eq!(cfg.engine, "stub");
    assert_eq!(cfg.camera.facing, LensFacing::Front);
    assert!((cfg.verify.threshold - 0.86).abs() < f32::EPSILON);
    assert_eq!(cfg.verify.retry_limit, 1);
    assert_eq!(cfg.search.interval, Duration::from_millis(2000));
    assert!(cfg.enroll.need_confirm);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "db_path": "faces_prod.db",
            "data_dir": "/var/lib/faceflow",
            "camera": {
                "facing": "back",
                "rotation": 90,
                "target_fps": 20,
                "high_resolution": true,
                "linear_zoom": 1.0
            },
            "verify": {
                "threshold": 0.9,
                "liveness": "color_flash_motion",
                "motion_step_size": 1,
                "motion_timeout_secs": 12,
                "performance_mode": "accurate"
            },
            "search": { "threshold": 0.9, "interval_ms": 500, "one_time": true },
            "enroll": { "need_confirm": false }
        }"#,
    );

    std::env::set_var("FACEFLOW_CONFIG", file.path());
    std::env::set_var("FACEFLOW_CAMERA_FACING", "external");
    std::env::set_var("FACEFLOW_RETRY_LIMIT", "3");
    std::env::set_var("FACEFLOW_SEARCH_THRESHOLD", "0.92");

    let cfg = KernelConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "faces_prod.db");
    assert_eq!(cfg.paths.search_dir, Path::new("/var/lib/faceflow").join("search"));
    assert_eq!(cfg.camera.facing, LensFacing::External);
    assert_eq!(cfg.camera.rotation, 90);
    assert_eq!(cfg.camera.target_fps, 20);
    assert_eq!(
        cfg.camera.capture_size(),
        (cfg.camera.width * 2, cfg.camera.height * 2)
    );
    assert!((cfg.camera.zoom_ratio() - MAX_DIGITAL_ZOOM).abs() < f32::EPSILON);
    assert_eq!(cfg.verify.liveness, LivenessType::ColorFlashMotion);
    assert_eq!(cfg.verify.motion_step_size, 1);
    assert_eq!(cfg.verify.motion_timeout, Duration::from_secs(12));
    assert_eq!(cfg.verify.performance_mode, PerformanceMode::Accurate);
    assert_eq!(cfg.verify.retry_limit, 3);
    assert_eq!(cfg.search.retry_limit, 3);
    assert!((cfg.search.threshold - 0.92).abs() < f32::EPSILON);
    assert_eq!(cfg.search.interval, Duration::from_millis(500));
    assert!(cfg.search.one_time);
    assert!(!cfg.enroll.need_confirm);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = write_config(
        ".toml",
        r#"
db_path = "faces.db"

[camera]
facing = "rear"
device = "/dev/video2"

[search]
require_liveness = true
"#,
    );
    std::env::set_var("FACEFLOW_CONFIG", file.path());

    let cfg = KernelConfig::load().expect("load toml config");
    assert_eq!(cfg.db_path, "faces.db");
    assert_eq!(cfg.camera.facing, LensFacing::Back);
    assert_eq!(cfg.camera.device.as_deref(), Some("/dev/video2"));
    assert!(cfg.search.require_liveness);

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("FACEFLOW_VERIFY_THRESHOLD", "0.5");
    assert!(KernelConfig::load().is_err());
    clear_env();

    std::env::set_var("FACEFLOW_SEARCH_THRESHOLD", "0.99");
    assert!(KernelConfig::load().is_err());
    clear_env();

    let file = write_config(".json", r#"{ "verify": { "motion_timeout_secs": 30 } }"#);
    std::env::set_var("FACEFLOW_CONFIG", file.path());
    assert!(KernelConfig::load().is_err());
    clear_env();

    let file = write_config(".json", r#"{ "camera": { "rotation": 45 } }"#);
    std::env::set_var("FACEFLOW_CONFIG", file.path());
    assert!(KernelConfig::load().is_err());
    clear_env();

    let file = write_config(".json", r#"{ "search": { "interval_ms": 9001 } }"#);
    std::env::set_var("FACEFLOW_CONFIG", file.path());
    assert!(KernelConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unparseable_env_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("FACEFLOW_RETRY_LIMIT", "-1");
    assert!(KernelConfig::load().is_err());
    clear_env();

    std::env::set_var("FACEFLOW_CAMERA_FACING", "sideways");
    assert!(KernelConfig::load().is_err());

    clear_env();
}
