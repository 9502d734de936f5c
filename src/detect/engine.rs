use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::frame::FrameView;
use crate::FlowKind;

/// Cropped face image as produced by the engine and persisted by the stores.
pub type FaceImage = RgbImage;

/// Engine quality/speed trade-off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    /// No quality gate at all.
    Unlimited,
    Easy,
    Fast,
    Accurate,
}

impl PerformanceMode {
    /// Minimum capture quality the engine accepts before reporting a face.
    pub fn min_quality(self) -> f32 {
        match self {
            PerformanceMode::Unlimited => 0.0,
            PerformanceMode::Easy => 0.3,
            PerformanceMode::Fast => 0.5,
            PerformanceMode::Accurate => 0.7,
        }
    }
}

/// Which liveness checks run before a face is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessType {
    None,
    Motion,
    ColorFlashMotion,
    ColorFlash,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineParams {
    pub liveness: LivenessType,
    pub motion_step_size: u8,
    pub motion_timeout: Duration,
    pub performance_mode: PerformanceMode,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            liveness: LivenessType::None,
            motion_step_size: 2,
            motion_timeout: Duration::from_secs(9),
            performance_mode: PerformanceMode::Fast,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FaceCapture {
    pub crop: FaceImage,
    /// 0..=1, engine-defined.
    pub quality: f32,
}

/// What one engine call produced.
#[derive(Clone, Debug)]
pub enum EngineOutcome {
    /// A face passed all checks.
    Face(FaceCapture),
    /// A guidance or failure code for the UI.
    Tip(i32),
    /// Frame consumed, nothing to report yet.
    Pending,
}

/// Face detection engine.
///
/// The engine is opaque: the kernel only decides which frames reach it and
/// reacts to what it reports. Implementations must not retain the view's
/// pixels past the `detect` call.
pub trait FaceEngine: Send {
    fn name(&self) -> &'static str;

    /// Returns true when the engine can drive the given flow.
    fn supports(&self, _kind: FlowKind) -> bool {
        true
    }

    fn configure(&mut self, _params: &EngineParams) -> Result<()> {
        Ok(())
    }

    fn detect(&mut self, frame: FrameView<'_>, kind: FlowKind) -> Result<EngineOutcome>;

    /// Dual-sensor detection. Engines without infrared support look at RGB only.
    fn detect_dual(
        &mut self,
        rgb: FrameView<'_>,
        _ir: FrameView<'_>,
        kind: FlowKind,
    ) -> Result<EngineOutcome> {
        self.detect(rgb, kind)
    }

    /// Forget per-attempt state (liveness progress, motion steps) before a retry.
    fn reset(&mut self) {}
}

pub type SharedEngine = Arc<Mutex<dyn FaceEngine>>;

#[derive(Clone, Debug)]
pub enum ExtractionOutcome {
    Extracted { feature: String, crop: FaceImage },
    Failed(String),
}

/// One-shot completion for an asynchronous extraction.
pub type ExtractionCallback = Box<dyn FnOnce(ExtractionOutcome) + Send>;

/// Feature extraction service.
pub trait FeatureExtractor: Send + Sync {
    /// Extract a feature from a full still image. `done` is invoked at most
    /// once, possibly on another thread.
    fn extract(&self, image: FaceImage, label: &str, done: ExtractionCallback);

    /// Extract a feature from an already cropped face.
    fn extract_cropped(&self, face: &FaceImage) -> Result<String>;
}

pub trait FeatureComparator: Send + Sync {
    /// Similarity in 0..=1, higher is closer.
    fn similarity(&self, a: &str, b: &str) -> Result<f32>;
}
