use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;

use crate::detect::engine::{
    EngineOutcome, EngineParams, ExtractionCallback, ExtractionOutcome, FaceCapture, FaceEngine,
    FaceImage, FeatureComparator, FeatureExtractor, LivenessType,
};
use crate::frame::{luma, FrameView};
use crate::tips::{EnrollTip, SearchTip, VerifyTip};
use crate::FlowKind;

/// Below this mean luminance a frame is treated as "no face in view".
const DARK_LUMA: f32 = 24.0;
/// Above this mean luminance the scene is over-exposed.
const BRIGHT_LUMA: f32 = 235.0;
/// Side length of the luminance grid a stub feature is built from.
const FEATURE_GRID: u32 = 8;

const MOTION_PROMPTS: [VerifyTip; 2] = [VerifyTip::Blink, VerifyTip::ShakeHead];

/// Stub engine for tests and demos.
///
/// Brightness stands in for face detection: dark frames have no face,
/// over-exposed frames fail with "light too high", everything else yields a
/// centre crop. Motion liveness is simulated by prompting one action per
/// accepted frame until `motion_step_size` steps are done.
pub struct StubEngine {
    params: EngineParams,
    attempt_started: Option<Instant>,
    motion_steps_done: u8,
    color_flash_done: bool,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            params: EngineParams::default(),
            attempt_started: None,
            motion_steps_done: 0,
            color_flash_done: false,
        }
    }

    fn runs_liveness(&self, kind: FlowKind) -> bool {
        kind != FlowKind::Enrollment && self.params.liveness != LivenessType::None
    }

    fn no_face_tip(kind: FlowKind) -> i32 {
        match kind {
            FlowKind::Verification | FlowKind::Liveness => VerifyTip::ActionNoFace.code(),
            FlowKind::Search => SearchTip::Searching.code(),
            FlowKind::Enrollment => EnrollTip::HeadCenter.code(),
        }
    }

    fn low_quality_tip(kind: FlowKind) -> i32 {
        match kind {
            FlowKind::Verification | FlowKind::Liveness => VerifyTip::FaceTooSmall.code(),
            FlowKind::Search => SearchTip::FaceTooSmall.code(),
            FlowKind::Enrollment => EnrollTip::FaceTooSmall.code(),
        }
    }

    /// Walk the simulated liveness checks. `None` means all checks passed.
    /// A search that runs out of time reports "no live face" instead of the
    /// verification timeout.
    fn liveness_step(&mut self, kind: FlowKind) -> Option<i32> {
        let started = *self.attempt_started.get_or_insert_with(Instant::now);
        if started.elapsed() > self.params.motion_timeout {
            return Some(match kind {
                FlowKind::Search => SearchTip::NoLiveFace.code(),
                _ => VerifyTip::MotionLiveTimeout.code(),
            });
        }
        let wants_motion = matches!(
            self.params.liveness,
            LivenessType::Motion | LivenessType::ColorFlashMotion
        );
        if wants_motion && self.motion_steps_done < self.params.motion_step_size {
            let prompt = MOTION_PROMPTS[self.motion_steps_done as usize % MOTION_PROMPTS.len()];
            self.motion_steps_done += 1;
            return Some(prompt.code());
        }
        let wants_color = matches!(
            self.params.liveness,
            LivenessType::ColorFlash | LivenessType::ColorFlashMotion
        );
        if wants_color && !self.color_flash_done {
            self.color_flash_done = true;
            return Some(VerifyTip::ColorFlashLiveSuccess.code());
        }
        None
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn configure(&mut self, params: &EngineParams) -> Result<()> {
        self.params = params.clone();
        self.reset();
        Ok(())
    }

    fn detect(&mut self, frame: FrameView<'_>, kind: FlowKind) -> Result<EngineOutcome> {
        let luma = frame.mean_luma();
        if luma < DARK_LUMA {
            return Ok(EngineOutcome::Tip(Self::no_face_tip(kind)));
        }
        if luma > BRIGHT_LUMA && kind != FlowKind::Enrollment {
            return Ok(EngineOutcome::Tip(VerifyTip::LightTooHigh.code()));
        }

        let quality = 1.0 - (luma - 128.0).abs() / 128.0;
        if quality < self.params.performance_mode.min_quality() {
            return Ok(EngineOutcome::Tip(Self::low_quality_tip(kind)));
        }

        if self.runs_liveness(kind) {
            if let Some(tip) = self.liveness_step(kind) {
                return Ok(EngineOutcome::Tip(tip));
            }
        }

        let crop = centre_crop(frame)?;
        Ok(EngineOutcome::Face(FaceCapture { crop, quality }))
    }

    fn reset(&mut self) {
        self.attempt_started = None;
        self.motion_steps_done = 0;
        self.color_flash_done = false;
    }
}

fn centre_crop(frame: FrameView<'_>) -> Result<FaceImage> {
    let (width, height) = (frame.width(), frame.height());
    let expected = width as usize * height as usize * 3;
    if frame.pixels().len() < expected {
        return Err(anyhow!(
            "frame {} holds {} bytes, expected {} for {}x{} rgb",
            frame.sequence(),
            frame.pixels().len(),
            expected,
            width,
            height
        ));
    }
    let full = RgbImage::from_raw(width, height, frame.pixels()[..expected].to_vec())
        .ok_or_else(|| anyhow!("frame {} has invalid dimensions", frame.sequence()))?;
    let side = (width.min(height) / 2).max(1);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    Ok(imageops::crop_imm(&full, x, y, side, side).to_image())
}

/// Stub feature extractor and comparator.
///
/// The feature is the hex-encoded luminance of an 8x8 thumbnail. Extraction
/// runs on its own thread to exercise the asynchronous completion path.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubExtractor;

impl StubExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn feature_of(image: &FaceImage) -> Result<String> {
    if image.width() == 0 || image.height() == 0 {
        return Err(anyhow!("empty image"));
    }
    let thumb = imageops::resize(image, FEATURE_GRID, FEATURE_GRID, FilterType::Triangle);
    let grid: Vec<u8> = thumb.pixels().map(|px| luma(px[0], px[1], px[2])).collect();
    let mean = grid.iter().map(|v| *v as f32).sum::<f32>() / grid.len() as f32;
    if mean < DARK_LUMA {
        return Err(anyhow!("no face found"));
    }
    Ok(hex::encode(grid))
}

fn square_crop(image: &FaceImage) -> FaceImage {
    let side = image.width().min(image.height());
    let x = (image.width() - side) / 2;
    let y = (image.height() - side) / 2;
    imageops::crop_imm(image, x, y, side, side).to_image()
}

impl FeatureExtractor for StubExtractor {
    fn extract(&self, image: FaceImage, label: &str, done: ExtractionCallback) {
        let label = label.to_string();
        std::thread::spawn(move || {
            let outcome = match feature_of(&image) {
                Ok(feature) => ExtractionOutcome::Extracted {
                    feature,
                    crop: square_crop(&image),
                },
                Err(err) => ExtractionOutcome::Failed(format!("{label}: {err}")),
            };
            done(outcome);
        });
    }

    fn extract_cropped(&self, face: &FaceImage) -> Result<String> {
        feature_of(face)
    }
}

impl FeatureComparator for StubExtractor {
    fn similarity(&self, a: &str, b: &str) -> Result<f32> {
        let a = hex::decode(a).map_err(|e| anyhow!("invalid feature: {}", e))?;
        let b = hex::decode(b).map_err(|e| anyhow!("invalid feature: {}", e))?;
        if a.is_empty() || a.len() != b.len() {
            return Err(anyhow!(
                "feature length mismatch ({} vs {} bytes)",
                a.len(),
                b.len()
            ));
        }
        let diff: u32 = a
            .iter()
            .zip(&b)
            .map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs())
            .sum();
        Ok(1.0 - diff as f32 / (a.len() as f32 * 255.0))
    }
}
