use anyhow::Result;
use std::time::{Duration, Instant};

use super::{FaceStep, FlowController, FlowEvent, FlowHandler, FlowResult, FlowServices, FlowSetup};
use crate::config::SearchSettings;
use crate::detect::{EngineParams, FaceCapture, LivenessType, PerformanceMode};
use crate::tips::{SearchTip, TipDispatcher};
use crate::{FlowKind, ResultCode};

struct SearchHandler {
    threshold: f32,
    interval: Duration,
    one_time: bool,
    last_match: Option<Instant>,
}

impl SearchHandler {
    fn within_interval(&self) -> bool {
        self.last_match
            .map(|at| at.elapsed() < self.interval)
            .unwrap_or(false)
    }
}

impl FlowHandler for SearchHandler {
    fn start(&mut self, services: &FlowServices) -> Result<Vec<FaceStep>> {
        let enrolled = services.library.search_len()?;
        log::info!("search library holds {} faces", enrolled);
        let tip = if enrolled == 0 {
            SearchTip::FaceDirEmpty
        } else {
            SearchTip::SearchPrepared
        };
        Ok(vec![FaceStep::Tip(tip.code())])
    }

    fn on_face(&mut self, capture: FaceCapture, services: &FlowServices) -> Vec<FaceStep> {
        if self.within_interval() {
            return Vec::new();
        }
        let feature = match services.extractor.extract_cropped(&capture.crop) {
            Ok(feature) => feature,
            Err(err) => {
                log::debug!("search: feature extraction failed: {:#}", err);
                return Vec::new();
            }
        };
        let matches = match services.library.search(&feature, services.comparator.as_ref()) {
            Ok(matches) => matches,
            Err(err) => {
                log::warn!("search: library lookup failed: {:#}", err);
                return Vec::new();
            }
        };
        let Some(best) = matches.into_iter().next() else {
            return vec![FaceStep::Tip(SearchTip::FaceDirEmpty.code())];
        };
        if best.similarity < self.threshold {
            log::trace!(
                "search: best candidate {} at {:.3} below threshold",
                best.label,
                best.similarity
            );
            return vec![FaceStep::Tip(SearchTip::NoMatched.code())];
        }

        self.last_match = Some(Instant::now());
        log::info!("search matched {} ({:.3})", best.label, best.similarity);
        let mut steps = vec![FaceStep::Event(FlowEvent::MostSimilar {
            label: best.label.clone(),
            similarity: best.similarity,
        })];
        if self.one_time {
            steps.push(FaceStep::Finish(
                FlowResult::new(FlowKind::Search, ResultCode::Success)
                    .with_label(best.label)
                    .with_similarity(best.similarity),
            ));
        }
        steps
    }

    fn on_retry(&mut self) {
        self.last_match = None;
    }
}

impl FlowController {
    /// 1:N search of live faces against the search library.
    pub fn search(setup: FlowSetup, settings: &SearchSettings) -> Result<Self> {
        let params = EngineParams {
            liveness: if settings.require_liveness {
                LivenessType::Motion
            } else {
                LivenessType::None
            },
            performance_mode: PerformanceMode::Fast,
            ..EngineParams::default()
        };
        let handler = SearchHandler {
            threshold: settings.threshold,
            interval: settings.interval,
            one_time: settings.one_time,
            last_match: None,
        };
        Self::launch(
            FlowKind::Search,
            setup,
            Box::new(handler),
            params,
            settings.retry_limit,
            TipDispatcher::new(FlowKind::Search).with_search_liveness(settings.require_liveness),
        )
    }
}
