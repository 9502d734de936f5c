use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use super::{DialogChoice, FaceStep, FlowEvent, FlowHandler, FlowResult, FlowServices, FlowSetup};
use crate::detect::{EngineOutcome, EngineParams, FaceCapture, SharedEngine};
use crate::error::FlowError;
use crate::retry::{abort_code, RetryCoordinator, RetryDecision};
use crate::session::{CaptureSession, ConfirmDecision, FrameReport, FrameWorker, SessionState};
use crate::tips::{DialogAction, DispatchTicket, Hint, TipDispatcher, UiIntent};
use crate::{FlowKind, ResultCode};

struct PendingDialog {
    ticket: DispatchTicket,
    action: DialogAction,
}

pub struct FlowController {
    kind: FlowKind,
    session: Arc<CaptureSession>,
    engine: SharedEngine,
    services: FlowServices,
    events: Sender<FlowEvent>,
    reports: Receiver<FrameReport>,
    worker: Option<FrameWorker>,
    dispatcher: TipDispatcher,
    retry: RetryCoordinator,
    handler: Box<dyn FlowHandler>,
    pending_dialog: Option<PendingDialog>,
    pending_face: Option<FaceCapture>,
    finished: Option<FlowResult>,
    reports_handled: u64,
}

impl FlowController {
    pub(crate) fn launch(
        kind: FlowKind,
        setup: FlowSetup,
        handler: Box<dyn FlowHandler>,
        params: EngineParams,
        retry_limit: u32,
        dispatcher: TipDispatcher,
    ) -> Result<Self> {
        let state = setup.session.state();
        if state != SessionState::Bound {
            return Err(FlowError::SessionState {
                state,
                expected: SessionState::Bound,
            }
            .into());
        }
        setup
            .engine
            .lock()
            .map_err(|_| anyhow!("face engine lock poisoned"))?
            .configure(&params)?;

        let (report_tx, report_rx) = mpsc::channel();
        let mut controller = Self {
            kind,
            session: setup.session,
            engine: setup.engine,
            services: setup.services,
            events: setup.events,
            reports: report_rx,
            worker: None,
            dispatcher,
            retry: RetryCoordinator::new(kind, retry_limit),
            handler,
            pending_dialog: None,
            pending_face: None,
            finished: None,
            reports_handled: 0,
        };

        let size_events = controller.events.clone();
        controller.session.set_size_listener(move |width, height| {
            let _ = size_events.send(FlowEvent::FrameSize { width, height });
        });

        let steps = controller.handler.start(&controller.services)?;
        controller.apply_all(steps);

        if controller.finished.is_none() {
            controller.worker = Some(FrameWorker::spawn(
                controller.session.clone(),
                controller.engine.clone(),
                kind,
                report_tx,
            ));
            log::info!("{:?} flow started", kind);
        }
        Ok(controller)
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn session(&self) -> &Arc<CaptureSession> {
        &self.session
    }

    pub fn result(&self) -> Option<&FlowResult> {
        self.finished.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Frame reports acted on so far (stale reports excluded).
    pub fn reports_handled(&self) -> u64 {
        self.reports_handled
    }

    /// Handle frame reports for up to `wait`, then drain whatever else is queued.
    pub fn pump(&mut self, wait: Duration) -> Option<FlowResult> {
        if self.finished.is_some() {
            return self.finished.clone();
        }
        match self.reports.recv_timeout(wait) {
            Ok(report) => self.handle_report(report),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if self.finished.is_none() {
                    log::error!("{:?} flow: frame worker stopped unexpectedly", self.kind);
                    self.finish(FlowResult::new(self.kind, ResultCode::CameraUnavailable));
                }
            }
        }
        while self.finished.is_none() {
            match self.reports.try_recv() {
                Ok(report) => self.handle_report(report),
                Err(_) => break,
            }
        }
        self.finished.clone()
    }

    pub(crate) fn handle_report(&mut self, report: FrameReport) {
        if self.finished.is_some() {
            return;
        }
        if !self.session.accepts(report.generation) {
            log::trace!(
                "{:?} flow: discarding report from gate generation {}",
                self.kind,
                report.generation
            );
            return;
        }
        self.reports_handled += 1;
        match report.outcome {
            Ok(EngineOutcome::Pending) => {}
            Ok(EngineOutcome::Tip(code)) => self.handle_tip(code),
            Ok(EngineOutcome::Face(capture)) => {
                let steps = self.handler.on_face(capture, &self.services);
                self.apply_all(steps);
            }
            Err(err) => log::warn!("{:?} flow: engine error: {:#}", self.kind, err),
        }
    }

    fn handle_tip(&mut self, code: i32) {
        let (ticket, intent) = self.dispatcher.dispatch(code);
        match intent {
            UiIntent::Dialog { hint, action } => {
                self.session.enter_confirmation();
                if let DialogAction::RetryOrAbort(failure) = action {
                    if let RetryDecision::Abort(code) = self.retry.on_terminal_failure(failure) {
                        let err = FlowError::TerminalDetection { code };
                        log::warn!("{:?} flow: {}", self.kind, err);
                        self.finish(FlowResult::new(self.kind, err.result_code()));
                        return;
                    }
                }
                self.pending_dialog = Some(PendingDialog { ticket, action });
                self.emit(FlowEvent::Intent {
                    ticket,
                    intent: UiIntent::Dialog { hint, action },
                });
            }
            UiIntent::Abort(code) => self.finish(FlowResult::new(self.kind, code)),
            other => self.emit(FlowEvent::Intent {
                ticket,
                intent: other,
            }),
        }
    }

    fn apply_all(&mut self, steps: Vec<FaceStep>) {
        for step in steps {
            if self.finished.is_some() {
                break;
            }
            self.apply(step);
        }
    }

    fn apply(&mut self, step: FaceStep) {
        match step {
            FaceStep::Tip(code) => self.handle_tip(code),
            FaceStep::Event(event) => self.emit(event),
            FaceStep::AwaitConfirm(capture) => {
                self.session.enter_confirmation();
                let quality = capture.quality;
                self.pending_face = Some(capture);
                self.emit(FlowEvent::ConfirmFace { quality });
            }
            FaceStep::Mismatch { similarity } => {
                self.session.enter_confirmation();
                let ticket = self.dispatcher.issue();
                let action = DialogAction::RetryOrFinish(ResultCode::VerifyMismatch);
                log::info!(
                    "{:?} flow: face mismatch (similarity {:.3})",
                    self.kind,
                    similarity
                );
                self.pending_dialog = Some(PendingDialog { ticket, action });
                self.emit(FlowEvent::Intent {
                    ticket,
                    intent: UiIntent::Dialog {
                        hint: Hint::VerifyMismatch,
                        action,
                    },
                });
            }
            FaceStep::Finish(result) => self.finish(result),
        }
    }

    /// Answer the dialog identified by `ticket`. Returns false when the
    /// ticket was superseded or no dialog is open.
    pub fn acknowledge_dialog(&mut self, ticket: DispatchTicket, choice: DialogChoice) -> bool {
        if self.finished.is_some() {
            return false;
        }
        let current = self
            .pending_dialog
            .as_ref()
            .map(|pending| pending.ticket == ticket && self.dispatcher.is_current(ticket))
            .unwrap_or(false);
        if !current {
            log::debug!("{:?} flow: ignoring stale dialog ticket {:?}", self.kind, ticket);
            return false;
        }
        let Some(pending) = self.pending_dialog.take() else {
            return false;
        };
        match (pending.action, choice) {
            (DialogAction::RetryOrAbort(_), DialogChoice::Retry)
            | (DialogAction::RetryOrFinish(_), DialogChoice::Retry) => self.restart_attempt(),
            (DialogAction::RetryOrAbort(failure), DialogChoice::Dismiss) => {
                self.finish(FlowResult::new(self.kind, abort_code(self.kind, failure)))
            }
            (DialogAction::RetryOrFinish(code), DialogChoice::Dismiss)
            | (DialogAction::Acknowledge(code), _) => {
                self.finish(FlowResult::new(self.kind, code))
            }
        }
        true
    }

    /// Accept the face awaiting confirmation. Enrollment only.
    pub fn confirm_enrollment(&mut self, label: Option<&str>) -> bool {
        if self.finished.is_some() {
            return false;
        }
        let Some(capture) = self.pending_face.take() else {
            return false;
        };
        let steps = self.handler.on_confirm(capture, label, &self.services);
        let finishes = steps.iter().any(|step| matches!(step, FaceStep::Finish(_)));
        self.apply_all(steps);
        if !finishes && self.finished.is_none() {
            self.restart_attempt();
        }
        true
    }

    /// Discard the face awaiting confirmation and resume capturing.
    pub fn reject_enrollment(&mut self) -> bool {
        if self.finished.is_some() || self.pending_face.take().is_none() {
            return false;
        }
        self.restart_attempt();
        true
    }

    fn restart_attempt(&mut self) {
        match self.engine.lock() {
            Ok(mut engine) => engine.reset(),
            Err(_) => log::warn!("{:?} flow: engine lock poisoned on retry", self.kind),
        }
        self.handler.on_retry();
        self.session.leave_confirmation(ConfirmDecision::Rejected);
        log::debug!("{:?} flow: attempt restarted", self.kind);
    }

    pub fn pause(&mut self) {
        self.session.pause();
    }

    pub fn resume(&mut self) {
        self.session.resume();
    }

    pub fn cancel(&mut self) {
        self.finish(FlowResult::new(self.kind, ResultCode::UserCancelled));
    }

    fn finish(&mut self, result: FlowResult) {
        if self.finished.is_some() {
            return;
        }
        self.shutdown();
        log::info!(
            "{:?} flow finished: {:?} ({})",
            self.kind,
            result.code,
            result.message
        );
        self.finished = Some(result.clone());
        self.emit(FlowEvent::Finished(result));
    }

    fn shutdown(&mut self) {
        self.pending_dialog = None;
        self.pending_face = None;
        self.session.teardown();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn emit(&self, event: FlowEvent) {
        if self.events.send(event).is_err() {
            log::debug!("{:?} flow: host stopped listening", self.kind);
        }
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        if self.finished.is_none() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraSettings, StoragePaths, VerifySettings};
    use crate::detect::{LivenessType, StubEngine, StubExtractor};
    use crate::lens::LensFacing;
    use crate::source::SyntheticPlatform;
    use crate::storage::FaceLibrary;
    use crate::tips::VerifyTip;
    use std::sync::Mutex;

    fn controller() -> (FlowController, std::sync::mpsc::Receiver<FlowEvent>, tempfile::TempDir) {
        let data = tempfile::tempdir().expect("tempdir");
        let library = Arc::new(FaceLibrary::in_memory(StoragePaths::under(data.path())));
        let crop = image::RgbImage::from_pixel(6, 6, image::Rgb([128, 128, 128]));
        let feature = crate::detect::FeatureExtractor::extract_cropped(&StubExtractor, &crop)
            .expect("feature");
        library.enroll_verify("alice", &feature, &crop).expect("enroll");

        let platform = SyntheticPlatform::single(LensFacing::Front).with_levels(vec![10]);
        let session = Arc::new(CaptureSession::new());
        session
            .bind(
                &platform,
                LensFacing::Front,
                &CameraSettings {
                    width: 8,
                    height: 8,
                    ..CameraSettings::default()
                },
            )
            .expect("bind");
        let extractor = Arc::new(StubExtractor::new());
        let (events, rx) = mpsc::channel();
        let setup = FlowSetup {
            session,
            engine: Arc::new(Mutex::new(StubEngine::new())),
            services: FlowServices {
                library,
                extractor: extractor.clone(),
                comparator: extractor,
            },
            events,
        };
        let settings = VerifySettings {
            liveness: LivenessType::None,
            ..VerifySettings::default()
        };
        let controller = FlowController::verification(setup, "alice", &settings).expect("launch");
        (controller, rx, data)
    }

    fn report(generation: u64, code: i32) -> FrameReport {
        FrameReport {
            generation,
            outcome: Ok(EngineOutcome::Tip(code)),
        }
    }

    #[test]
    fn reports_from_an_older_generation_are_discarded() {
        let (mut controller, _events, _data) = controller();
        let before = controller.session.gate().generation();
        controller.pause();
        controller.resume();
        let handled = controller.reports_handled();

        controller.handle_report(report(before, VerifyTip::LightTooHigh.code()));
        assert_eq!(controller.reports_handled(), handled);
        assert_eq!(controller.retry.state().attempt_count, 0);

        let current = controller.session.gate().generation();
        controller.handle_report(report(current, VerifyTip::LightTooHigh.code()));
        assert_eq!(controller.reports_handled(), handled + 1);
        assert_eq!(controller.retry.state().attempt_count, 1);
        assert!(!controller.session.gate().is_open());
        controller.cancel();
    }

    #[test]
    fn engine_errors_do_not_end_the_flow() {
        let (mut controller, _events, _data) = controller();
        let generation = controller.session.gate().generation();
        controller.handle_report(FrameReport {
            generation,
            outcome: Err(anyhow!("detector crashed")),
        });
        assert!(!controller.is_finished());
        controller.cancel();
        assert_eq!(
            controller.result().map(|r| r.code),
            Some(ResultCode::UserCancelled)
        );
    }
}
