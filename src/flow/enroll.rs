use anyhow::{anyhow, Result};

use super::{FaceStep, FlowController, FlowEvent, FlowHandler, FlowResult, FlowServices, FlowSetup};
use crate::config::EnrollSettings;
use crate::detect::{EngineParams, FaceCapture, LivenessType};
use crate::tips::TipDispatcher;
use crate::{validate_label, FlowKind, ResultCode};

/// Which library an enrolled face lands in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnrollTarget {
    Verify,
    Search { tag: String, group: String },
}

struct EnrollHandler {
    target: EnrollTarget,
    label: Option<String>,
    need_confirm: bool,
}

impl EnrollHandler {
    fn save(&self, capture: &FaceCapture, label: &str, services: &FlowServices) -> Vec<FaceStep> {
        let feature = match services.extractor.extract_cropped(&capture.crop) {
            Ok(feature) => feature,
            Err(err) => {
                return vec![FaceStep::Event(FlowEvent::Rejected {
                    reason: format!("feature extraction failed: {:#}", err),
                })]
            }
        };
        let stored = match &self.target {
            EnrollTarget::Verify => services.library.enroll_verify(label, &feature, &capture.crop),
            EnrollTarget::Search { tag, group } => {
                services
                    .library
                    .enroll_search(label, &feature, &capture.crop, tag, group)
            }
        };
        match stored {
            Ok(()) => vec![FaceStep::Finish(
                FlowResult::new(FlowKind::Enrollment, ResultCode::Success)
                    .with_label(label)
                    .with_feature(feature),
            )],
            Err(err) => {
                log::warn!("enrollment of {} failed: {:#}", label, err);
                vec![FaceStep::Event(FlowEvent::Rejected {
                    reason: format!("{:#}", err),
                })]
            }
        }
    }
}

impl FlowHandler for EnrollHandler {
    fn on_face(&mut self, capture: FaceCapture, services: &FlowServices) -> Vec<FaceStep> {
        if self.need_confirm {
            return vec![FaceStep::AwaitConfirm(capture)];
        }
        match self.label.clone() {
            Some(label) => self.save(&capture, &label, services),
            None => Vec::new(),
        }
    }

    fn on_confirm(
        &mut self,
        capture: FaceCapture,
        label: Option<&str>,
        services: &FlowServices,
    ) -> Vec<FaceStep> {
        let Some(label) = label.map(str::to_string).or_else(|| self.label.clone()) else {
            return vec![FaceStep::Event(FlowEvent::Rejected {
                reason: "a label is required to enroll a face".to_string(),
            })];
        };
        if let Err(err) = validate_label(&label) {
            return vec![FaceStep::Event(FlowEvent::Rejected {
                reason: format!("{:#}", err),
            })];
        }
        self.save(&capture, &label, services)
    }
}

impl FlowController {
    /// Capture one face and add it to the verify or search library.
    ///
    /// Without confirmation the label must be known up front; with
    /// confirmation it may also be supplied to `confirm_enrollment`.
    pub fn enrollment(
        setup: FlowSetup,
        target: EnrollTarget,
        label: Option<String>,
        settings: &EnrollSettings,
    ) -> Result<Self> {
        if let Some(label) = label.as_deref() {
            validate_label(label)?;
        }
        if !settings.need_confirm && label.is_none() {
            return Err(anyhow!("enrollment without confirmation needs a label"));
        }
        let params = EngineParams {
            liveness: LivenessType::None,
            performance_mode: settings.performance_mode,
            ..EngineParams::default()
        };
        let handler = EnrollHandler {
            target,
            label,
            need_confirm: settings.need_confirm,
        };
        Self::launch(
            FlowKind::Enrollment,
            setup,
            Box::new(handler),
            params,
            0,
            TipDispatcher::new(FlowKind::Enrollment),
        )
    }
}
