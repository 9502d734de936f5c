use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{LivenessType, PerformanceMode};
use crate::lens::LensFacing;

const DEFAULT_DB_PATH: &str = "faceflow.db";
const DEFAULT_DATA_DIR: &str = "faceflow-data";
const DEFAULT_ENGINE: &str = "stub";
const DEFAULT_CAMERA_FPS: u32 = 15;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_VERIFY_THRESHOLD: f32 = 0.86;
const DEFAULT_SEARCH_THRESHOLD: f32 = 0.88;
const DEFAULT_MOTION_STEP_SIZE: u8 = 2;
const DEFAULT_MOTION_TIMEOUT_SECS: u32 = 9;
const DEFAULT_SEARCH_INTERVAL_MS: u64 = 2000;
const DEFAULT_RETRY_LIMIT: u32 = 1;

const VERIFY_THRESHOLD_RANGE: (f32, f32) = (0.75, 0.95);
const SEARCH_THRESHOLD_RANGE: (f32, f32) = (0.85, 0.95);

#[derive(Debug, Deserialize, Default)]
struct KernelConfigFile {
    db_path: Option<String>,
    data_dir: Option<PathBuf>,
    engine: Option<String>,
    camera: Option<CameraConfigFile>,
    verify: Option<VerifyConfigFile>,
    search: Option<SearchConfigFile>,
    enroll: Option<EnrollConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    facing: Option<LensFacing>,
    device: Option<String>,
    high_resolution: Option<bool>,
    linear_zoom: Option<f32>,
    rotation: Option<u16>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct VerifyConfigFile {
    threshold: Option<f32>,
    liveness: Option<LivenessType>,
    motion_step_size: Option<u8>,
    motion_timeout_secs: Option<u32>,
    retry_limit: Option<u32>,
    performance_mode: Option<PerformanceMode>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchConfigFile {
    threshold: Option<f32>,
    interval_ms: Option<u64>,
    one_time: Option<bool>,
    require_liveness: Option<bool>,
    retry_limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EnrollConfigFile {
    performance_mode: Option<PerformanceMode>,
    need_confirm: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub db_path: String,
    pub engine: String,
    pub paths: StoragePaths,
    pub camera: CameraSettings,
    pub verify: VerifySettings,
    pub search: SearchSettings,
    pub enroll: EnrollSettings,
}

/// Directories for cached face images, one per purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub verify_dir: PathBuf,
    pub search_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl StoragePaths {
    pub fn under(root: &Path) -> Self {
        Self {
            verify_dir: root.join("verify"),
            search_dir: root.join("search"),
            log_dir: root.join("log"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub facing: LensFacing,
    /// Pins a specific device id; `stub://` ids select the synthetic platform.
    pub device: Option<String>,
    pub high_resolution: bool,
    pub linear_zoom: f32,
    pub rotation: u16,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            facing: LensFacing::Front,
            device: None,
            high_resolution: false,
            linear_zoom: 0.0,
            rotation: 0,
            target_fps: DEFAULT_CAMERA_FPS,
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
        }
    }
}

/// Zoom factor reached at `linear_zoom == 1.0`.
pub const MAX_DIGITAL_ZOOM: f32 = 4.0;

impl CameraSettings {
    /// Resolution requested from the sensor. High resolution doubles both sides.
    pub fn capture_size(&self) -> (u32, u32) {
        if self.high_resolution {
            (self.width.saturating_mul(2), self.height.saturating_mul(2))
        } else {
            (self.width, self.height)
        }
    }

    /// Digital zoom ratio, linear between 1x and `MAX_DIGITAL_ZOOM`.
    pub fn zoom_ratio(&self) -> f32 {
        1.0 + self.linear_zoom.clamp(0.0, 1.0) * (MAX_DIGITAL_ZOOM - 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub threshold: f32,
    pub liveness: LivenessType,
    pub motion_step_size: u8,
    pub motion_timeout: Duration,
    pub retry_limit: u32,
    pub performance_mode: PerformanceMode,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VERIFY_THRESHOLD,
            liveness: LivenessType::Motion,
            motion_step_size: DEFAULT_MOTION_STEP_SIZE,
            motion_timeout: Duration::from_secs(DEFAULT_MOTION_TIMEOUT_SECS as u64),
            retry_limit: DEFAULT_RETRY_LIMIT,
            performance_mode: PerformanceMode::Fast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub threshold: f32,
    /// Minimum spacing between two reported matches.
    pub interval: Duration,
    /// Finish the flow on the first match instead of searching continuously.
    pub one_time: bool,
    /// Run liveness before matching; a face that never proves live ends the flow.
    pub require_liveness: bool,
    pub retry_limit: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SEARCH_THRESHOLD,
            interval: Duration::from_millis(DEFAULT_SEARCH_INTERVAL_MS),
            one_time: false,
            require_liveness: false,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollSettings {
    pub performance_mode: PerformanceMode,
    pub need_confirm: bool,
}

impl Default for EnrollSettings {
    fn default() -> Self {
        Self {
            performance_mode: PerformanceMode::Accurate,
            need_confirm: true,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            engine: DEFAULT_ENGINE.to_string(),
            paths: StoragePaths::under(Path::new(DEFAULT_DATA_DIR)),
            camera: CameraSettings::default(),
            verify: VerifySettings::default(),
            search: SearchSettings::default(),
            enroll: EnrollSettings::default(),
        }
    }
}

impl KernelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACEFLOW_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KernelConfigFile) -> Self {
        let defaults = KernelConfig::default();
        let paths = file
            .data_dir
            .as_deref()
            .map(StoragePaths::under)
            .unwrap_or(defaults.paths);

        let camera = file.camera.unwrap_or_default();
        let camera_defaults = defaults.camera;
        let camera = CameraSettings {
            facing: camera.facing.unwrap_or(camera_defaults.facing),
            device: camera.device,
            high_resolution: camera
                .high_resolution
                .unwrap_or(camera_defaults.high_resolution),
            linear_zoom: camera.linear_zoom.unwrap_or(camera_defaults.linear_zoom),
            rotation: camera.rotation.unwrap_or(camera_defaults.rotation),
            target_fps: camera.target_fps.unwrap_or(camera_defaults.target_fps),
            width: camera.width.unwrap_or(camera_defaults.width),
            height: camera.height.unwrap_or(camera_defaults.height),
        };

        let verify = file.verify.unwrap_or_default();
        let verify_defaults = defaults.verify;
        let verify = VerifySettings {
            threshold: verify.threshold.unwrap_or(verify_defaults.threshold),
            liveness: verify.liveness.unwrap_or(verify_defaults.liveness),
            motion_step_size: verify
                .motion_step_size
                .unwrap_or(verify_defaults.motion_step_size),
            motion_timeout: verify
                .motion_timeout_secs
                .map(|s| Duration::from_secs(s as u64))
                .unwrap_or(verify_defaults.motion_timeout),
            retry_limit: verify.retry_limit.unwrap_or(verify_defaults.retry_limit),
            performance_mode: verify
                .performance_mode
                .unwrap_or(verify_defaults.performance_mode),
        };

        let search = file.search.unwrap_or_default();
        let search_defaults = defaults.search;
        let search = SearchSettings {
            threshold: search.threshold.unwrap_or(search_defaults.threshold),
            interval: search
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(search_defaults.interval),
            one_time: search.one_time.unwrap_or(search_defaults.one_time),
            require_liveness: search
                .require_liveness
                .unwrap_or(search_defaults.require_liveness),
            retry_limit: search.retry_limit.unwrap_or(search_defaults.retry_limit),
        };

        let enroll = file.enroll.unwrap_or_default();
        let enroll_defaults = defaults.enroll;
        let enroll = EnrollSettings {
            performance_mode: enroll
                .performance_mode
                .unwrap_or(enroll_defaults.performance_mode),
            need_confirm: enroll.need_confirm.unwrap_or(enroll_defaults.need_confirm),
        };

        Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            engine: file.engine.unwrap_or(defaults.engine),
            paths,
            camera,
            verify,
            search,
            enroll,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FACEFLOW_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("FACEFLOW_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.paths = StoragePaths::under(Path::new(&dir));
            }
        }
        if let Ok(facing) = std::env::var("FACEFLOW_CAMERA_FACING") {
            if !facing.trim().is_empty() {
                self.camera.facing = facing.parse()?;
            }
        }
        if let Ok(threshold) = std::env::var("FACEFLOW_VERIFY_THRESHOLD") {
            self.verify.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEFLOW_VERIFY_THRESHOLD must be a decimal number"))?;
        }
        if let Ok(threshold) = std::env::var("FACEFLOW_SEARCH_THRESHOLD") {
            self.search.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEFLOW_SEARCH_THRESHOLD must be a decimal number"))?;
        }
        if let Ok(limit) = std::env::var("FACEFLOW_RETRY_LIMIT") {
            let limit: u32 = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEFLOW_RETRY_LIMIT must be a non-negative integer"))?;
            self.verify.retry_limit = limit;
            self.search.retry_limit = limit;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        check_range(
            "verify threshold",
            self.verify.threshold,
            VERIFY_THRESHOLD_RANGE,
        )?;
        check_range(
            "search threshold",
            self.search.threshold,
            SEARCH_THRESHOLD_RANGE,
        )?;
        if !(1..=2).contains(&self.verify.motion_step_size) {
            return Err(anyhow!("motion step size must be 1 or 2"));
        }
        let timeout = self.verify.motion_timeout.as_secs();
        if !(3..=22).contains(&timeout) {
            return Err(anyhow!(
                "motion timeout must be between 3 and 22 seconds, got {}",
                timeout
            ));
        }
        if self.search.interval > Duration::from_millis(9000) {
            return Err(anyhow!("search interval must not exceed 9000 ms"));
        }
        if !(0.0..=1.0).contains(&self.camera.linear_zoom) {
            return Err(anyhow!("linear zoom must be within [0, 1]"));
        }
        if !matches!(self.camera.rotation, 0 | 90 | 180 | 270) {
            return Err(anyhow!(
                "rotation must be one of 0, 90, 180, 270; got {}",
                self.camera.rotation
            ));
        }
        if self.camera.target_fps == 0 || self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera fps and resolution must be non-zero"));
        }
        if self.engine.trim().is_empty() {
            return Err(anyhow!("engine name must not be empty"));
        }
        Ok(())
    }
}

fn check_range(name: &str, value: f32, (lo, hi): (f32, f32)) -> Result<()> {
    if !(lo..=hi).contains(&value) {
        return Err(anyhow!(
            "{} {} outside allowed range [{}, {}]",
            name,
            value,
            lo,
            hi
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<KernelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
