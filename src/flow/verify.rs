use anyhow::Result;

use super::{FaceStep, FlowController, FlowHandler, FlowResult, FlowServices, FlowSetup};
use crate::config::VerifySettings;
use crate::detect::{EngineParams, FaceCapture};
use crate::tips::TipDispatcher;
use crate::{FlowKind, ResultCode};

struct VerifyHandler {
    label: String,
    threshold: f32,
    reference: Option<String>,
}

impl FlowHandler for VerifyHandler {
    fn start(&mut self, services: &FlowServices) -> Result<Vec<FaceStep>> {
        self.reference = services.library.reference_feature(&self.label)?;
        if self.reference.is_none() {
            log::warn!("no enrolled face feature for {}", self.label);
            return Ok(vec![FaceStep::Finish(FlowResult::new(
                FlowKind::Verification,
                ResultCode::NoFaceFeature,
            ))]);
        }
        Ok(Vec::new())
    }

    fn on_face(&mut self, capture: FaceCapture, services: &FlowServices) -> Vec<FaceStep> {
        let Some(reference) = self.reference.as_deref() else {
            return Vec::new();
        };
        let feature = match services.extractor.extract_cropped(&capture.crop) {
            Ok(feature) => feature,
            Err(err) => {
                log::debug!("verification: feature extraction failed: {:#}", err);
                return Vec::new();
            }
        };
        let similarity = match services.comparator.similarity(&feature, reference) {
            Ok(similarity) => similarity,
            Err(err) => {
                log::warn!("verification: feature comparison failed: {:#}", err);
                return Vec::new();
            }
        };
        log::debug!(
            "verification of {}: similarity {:.3} (threshold {:.2})",
            self.label,
            similarity,
            self.threshold
        );
        if similarity < self.threshold {
            return vec![FaceStep::Mismatch { similarity }];
        }
        if let Err(err) = services.library.save_scene(&self.label, &capture.crop) {
            log::warn!("failed to keep verification scene for {}: {:#}", self.label, err);
        }
        vec![FaceStep::Finish(
            FlowResult::new(FlowKind::Verification, ResultCode::Success)
                .with_label(self.label.clone())
                .with_similarity(similarity)
                .with_feature(feature),
        )]
    }
}

impl FlowController {
    /// 1:1 verification of the live face against `label`'s enrolled feature.
    pub fn verification(
        setup: FlowSetup,
        label: &str,
        settings: &VerifySettings,
    ) -> Result<Self> {
        let params = EngineParams {
            liveness: settings.liveness,
            motion_step_size: settings.motion_step_size,
            motion_timeout: settings.motion_timeout,
            performance_mode: settings.performance_mode,
        };
        let handler = VerifyHandler {
            label: label.to_string(),
            threshold: settings.threshold,
            reference: None,
        };
        Self::launch(
            FlowKind::Verification,
            setup,
            Box::new(handler),
            params,
            settings.retry_limit,
            TipDispatcher::new(FlowKind::Verification),
        )
    }
}
