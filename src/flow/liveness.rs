use anyhow::Result;

use super::{FaceStep, FlowController, FlowHandler, FlowResult, FlowServices, FlowSetup};
use crate::config::VerifySettings;
use crate::detect::{EngineParams, FaceCapture, LivenessType};
use crate::tips::TipDispatcher;
use crate::{FlowKind, ResultCode};

/// Liveness only: the first face that clears every check ends the flow.
struct LivenessHandler;

impl FlowHandler for LivenessHandler {
    fn on_face(&mut self, capture: FaceCapture, _services: &FlowServices) -> Vec<FaceStep> {
        log::info!("liveness passed (quality {:.2})", capture.quality);
        vec![FaceStep::Finish(FlowResult::new(
            FlowKind::Liveness,
            ResultCode::LivenessDone,
        ))]
    }
}

impl FlowController {
    pub fn liveness(setup: FlowSetup, settings: &VerifySettings) -> Result<Self> {
        let liveness = match settings.liveness {
            LivenessType::None => LivenessType::Motion,
            other => other,
        };
        let params = EngineParams {
            liveness,
            motion_step_size: settings.motion_step_size,
            motion_timeout: settings.motion_timeout,
            performance_mode: settings.performance_mode,
        };
        Self::launch(
            FlowKind::Liveness,
            setup,
            Box::new(LivenessHandler),
            params,
            settings.retry_limit,
            TipDispatcher::new(FlowKind::Liveness),
        )
    }
}
