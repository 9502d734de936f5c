use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::{Rgb, RgbImage};
use tempfile::TempDir;

use faceflow_kernel::config::{CameraSettings, EnrollSettings, SearchSettings, VerifySettings};
use faceflow_kernel::source::SyntheticStats;
use faceflow_kernel::tips::{DialogAction, SearchTip};
use faceflow_kernel::{
    CaptureSession, DialogChoice, DispatchTicket, EngineOutcome, EnrollTarget, FaceEngine,
    FaceLibrary, FeatureExtractor, FlowController, FlowEvent, FlowKind, FlowServices, FlowSetup,
    FrameView, Hint, LensFacing, LivenessType,
    ResultCode, SessionState, SharedEngine, StoragePaths, StubEngine, StubExtractor,
    SyntheticPlatform, UiIntent,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    library: Arc<FaceLibrary>,
    data: TempDir,
}

impl Rig {
    fn new() -> Result<Self> {
        let data = tempfile::tempdir()?;
        let library = Arc::new(FaceLibrary::in_memory(StoragePaths::under(data.path())));
        Ok(Self { library, data })
    }

    fn feature(level: u8) -> Result<String> {
        StubExtractor::new().extract_cropped(&face(level))
    }

    fn enroll_verify(&self, label: &str, level: u8) -> Result<()> {
        self.library
            .enroll_verify(label, &Self::feature(level)?, &face(level))
    }

    fn enroll_search(&self, label: &str, level: u8) -> Result<()> {
        self.library
            .enroll_search(label, &Self::feature(level)?, &face(level), "", "")
    }

    /// Bind a synthetic camera whose frames all have brightness `level`.
    fn setup(&self, level: u8) -> (FlowSetup, Receiver<FlowEvent>, Arc<SyntheticStats>) {
        let platform = SyntheticPlatform::single(LensFacing::Front).with_levels(vec![level]);
        let stats = platform.stats();
        let session = Arc::new(CaptureSession::new());
        session
            .bind(
                &platform,
                LensFacing::Front,
                &CameraSettings {
                    width: 16,
                    height: 12,
                    ..CameraSettings::default()
                },
            )
            .expect("bind synthetic camera");
        let engine: SharedEngine = Arc::new(Mutex::new(StubEngine::new()));
        let extractor = Arc::new(StubExtractor::new());
        let (events, rx) = mpsc::channel();
        let setup = FlowSetup {
            session,
            engine,
            services: FlowServices {
                library: self.library.clone(),
                extractor: extractor.clone(),
                comparator: extractor,
            },
            events,
        };
        (setup, rx, stats)
    }
}

fn face(level: u8) -> RgbImage {
    RgbImage::from_pixel(6, 6, Rgb([level, level, level]))
}

fn no_liveness() -> VerifySettings {
    VerifySettings {
        liveness: LivenessType::None,
        ..VerifySettings::default()
    }
}

/// Pump the controller until an event matching `pred` arrives.
fn wait_event(
    controller: &mut FlowController,
    events: &Receiver<FlowEvent>,
    mut pred: impl FnMut(&FlowEvent) -> bool,
) -> Option<FlowEvent> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        controller.pump(Duration::from_millis(10));
        while let Ok(event) = events.try_recv() {
            if pred(&event) {
                return Some(event);
            }
        }
    }
    None
}

fn wait_dialog(
    controller: &mut FlowController,
    events: &Receiver<FlowEvent>,
) -> (DispatchTicket, Hint, DialogAction) {
    match wait_event(controller, events, |e| {
        matches!(
            e,
            FlowEvent::Intent {
                intent: UiIntent::Dialog { .. },
                ..
            }
        )
    }) {
        Some(FlowEvent::Intent {
            ticket,
            intent: UiIntent::Dialog { hint, action },
        }) => (ticket, hint, action),
        other => panic!("expected a dialog, got {:?}", other),
    }
}

fn wait_finished(controller: &mut FlowController) -> faceflow_kernel::FlowResult {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(result) = controller.pump(Duration::from_millis(10)) {
            return result;
        }
    }
    panic!("flow did not finish");
}

#[test]
fn verification_matches_enrolled_face() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 128)?;
    let (setup, _events, stats) = rig.setup(128);
    let session = setup.session.clone();

    let mut controller = FlowController::verification(setup, "alice", &no_liveness())?;
    let result = wait_finished(&mut controller);

    assert_eq!(result.code, ResultCode::Success);
    assert_eq!(result.label.as_deref(), Some("alice"));
    assert!(result.similarity.unwrap_or_default() > 0.99);
    assert!(result.feature.is_some());
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(stats.released.load(Ordering::SeqCst), 1);
    let scenes = std::fs::read_dir(rig.data.path().join("log"))?.count();
    assert_eq!(scenes, 1);
    Ok(())
}

#[test]
fn verification_without_reference_finishes_before_streaming() -> Result<()> {
    let rig = Rig::new()?;
    let (setup, events, _stats) = rig.setup(128);
    let session = setup.session.clone();

    let controller = FlowController::verification(setup, "nobody", &no_liveness())?;

    assert_eq!(
        controller.result().map(|r| r.code),
        Some(ResultCode::NoFaceFeature)
    );
    assert_eq!(session.state(), SessionState::Unbound);
    assert!(matches!(events.try_recv(), Ok(FlowEvent::Finished(_))));
    Ok(())
}

#[test]
fn mismatch_offers_retry_and_ignores_stale_tickets() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 200)?;
    let (setup, events, _stats) = rig.setup(128);
    let mut controller = FlowController::verification(setup, "alice", &no_liveness())?;

    let (first, hint, action) = wait_dialog(&mut controller, &events);
    assert_eq!(hint, Hint::VerifyMismatch);
    assert_eq!(action, DialogAction::RetryOrFinish(ResultCode::VerifyMismatch));
    assert!(controller.acknowledge_dialog(first, DialogChoice::Retry));
    assert!(!controller.acknowledge_dialog(first, DialogChoice::Dismiss));

    let (second, _, _) = wait_dialog(&mut controller, &events);
    assert_ne!(first, second);
    assert!(!controller.acknowledge_dialog(first, DialogChoice::Dismiss));
    assert!(controller.acknowledge_dialog(second, DialogChoice::Dismiss));

    let result = controller.result().cloned().expect("finished");
    assert_eq!(result.code, ResultCode::VerifyMismatch);
    assert!(!result.is_success());
    Ok(())
}

#[test]
fn terminal_failure_retries_once_then_aborts() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 128)?;
    let (setup, events, _stats) = rig.setup(250);
    let mut controller = FlowController::verification(setup, "alice", &no_liveness())?;

    let (ticket, hint, action) = wait_dialog(&mut controller, &events);
    assert_eq!(hint, Hint::LightTooHigh);
    assert!(matches!(action, DialogAction::RetryOrAbort(_)));
    assert!(controller.acknowledge_dialog(ticket, DialogChoice::Retry));

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::LightTooHigh);
    Ok(())
}

#[test]
fn zero_retry_budget_aborts_without_a_dialog() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 128)?;
    let (setup, events, _stats) = rig.setup(250);
    let settings = VerifySettings {
        retry_limit: 0,
        ..no_liveness()
    };
    let mut controller = FlowController::verification(setup, "alice", &settings)?;

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::LightTooHigh);
    let dialogs = events
        .try_iter()
        .filter(|e| {
            matches!(
                e,
                FlowEvent::Intent {
                    intent: UiIntent::Dialog { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(dialogs, 0);
    Ok(())
}

#[test]
fn liveness_prompts_motion_before_finishing() -> Result<()> {
    let rig = Rig::new()?;
    let (setup, events, _stats) = rig.setup(128);
    let mut controller = FlowController::liveness(setup, &VerifySettings::default())?;

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::LivenessDone);
    assert!(result.is_success());

    let prompts: Vec<Hint> = events
        .try_iter()
        .filter_map(|e| match e {
            FlowEvent::Intent {
                intent: UiIntent::Primary { hint, cue: Some(_) },
                ..
            } => Some(hint),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec![Hint::Blink, Hint::ShakeHead]);
    Ok(())
}

#[test]
fn enrollment_reject_reopens_and_accept_saves() -> Result<()> {
    let rig = Rig::new()?;
    let (setup, events, _stats) = rig.setup(128);
    let session = setup.session.clone();
    let target = EnrollTarget::Search {
        tag: "staff".to_string(),
        group: "day".to_string(),
    };
    let mut controller =
        FlowController::enrollment(setup, target, None, &EnrollSettings::default())?;

    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::ConfirmFace { .. })).is_some());
    assert!(!session.gate().is_open());
    assert!(controller.reject_enrollment());
    assert!(session.gate().is_open());
    assert!(!controller.confirm_enrollment(Some("bob")), "nothing awaiting confirmation");

    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::ConfirmFace { .. })).is_some());
    assert!(controller.confirm_enrollment(Some("bob")));

    let result = controller.result().cloned().expect("finished");
    assert_eq!(result.code, ResultCode::Success);
    assert_eq!(result.label.as_deref(), Some("bob"));
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(rig.library.search_len()?, 1);
    assert!(rig.data.path().join("search").join("bob.png").is_file());
    Ok(())
}

#[test]
fn enrollment_confirmation_without_label_is_rejected() -> Result<()> {
    let rig = Rig::new()?;
    let (setup, events, _stats) = rig.setup(128);
    let mut controller = FlowController::enrollment(
        setup,
        EnrollTarget::Verify,
        None,
        &EnrollSettings::default(),
    )?;

    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::ConfirmFace { .. })).is_some());
    assert!(controller.confirm_enrollment(None));
    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::Rejected { .. })).is_some());
    assert!(!controller.is_finished());

    controller.cancel();
    assert_eq!(
        controller.result().map(|r| r.code),
        Some(ResultCode::UserCancelled)
    );
    Ok(())
}

#[test]
fn enrollment_without_confirmation_needs_label() -> Result<()> {
    let rig = Rig::new()?;
    let settings = EnrollSettings {
        need_confirm: false,
        ..EnrollSettings::default()
    };

    let (setup, _events, _stats) = rig.setup(128);
    assert!(FlowController::enrollment(setup, EnrollTarget::Verify, None, &settings).is_err());

    let (setup, _events, _stats) = rig.setup(128);
    let mut controller = FlowController::enrollment(
        setup,
        EnrollTarget::Verify,
        Some("carol".to_string()),
        &settings,
    )?;
    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::Success);
    assert_eq!(
        rig.library.reference_feature("carol")?,
        Some(Rig::feature(128)?)
    );
    Ok(())
}

#[test]
fn one_time_search_finishes_on_first_match() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_search("bright", 250)?;
    rig.enroll_search("bob", 128)?;
    let (setup, events, _stats) = rig.setup(128);
    let settings = SearchSettings {
        one_time: true,
        ..SearchSettings::default()
    };
    let mut controller = FlowController::search(setup, &settings)?;

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::Success);
    assert_eq!(result.label.as_deref(), Some("bob"));

    let events: Vec<FlowEvent> = events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Intent {
            intent: UiIntent::Primary {
                hint: Hint::SearchReady,
                ..
            },
            ..
        }
    )));
    let matches: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::MostSimilar { label, .. } => Some(label.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(matches, vec!["bob"]);
    Ok(())
}

#[test]
fn continuous_search_suppresses_matches_within_interval() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_search("bob", 128)?;
    let (setup, events, _stats) = rig.setup(128);
    let settings = SearchSettings {
        interval: Duration::from_millis(9000),
        ..SearchSettings::default()
    };
    let mut controller = FlowController::search(setup, &settings)?;

    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::MostSimilar { .. })).is_some());
    let until = Instant::now() + Duration::from_millis(200);
    while Instant::now() < until {
        controller.pump(Duration::from_millis(10));
    }
    let repeats = events
        .try_iter()
        .filter(|e| matches!(e, FlowEvent::MostSimilar { .. }))
        .count();
    assert_eq!(repeats, 0);
    assert!(controller.reports_handled() > 1);

    controller.cancel();
    assert_eq!(
        controller.result().map(|r| r.code),
        Some(ResultCode::UserCancelled)
    );
    Ok(())
}

#[test]
fn search_reports_empty_library_and_misses() -> Result<()> {
    let rig = Rig::new()?;
    let (setup, events, _stats) = rig.setup(128);
    let mut controller = FlowController::search(setup, &SearchSettings::default())?;
    let library_empty = |e: &FlowEvent| {
        matches!(
            e,
            FlowEvent::Intent {
                intent: UiIntent::Primary {
                    hint: Hint::LibraryEmpty,
                    ..
                },
                ..
            }
        )
    };
    assert!(wait_event(&mut controller, &events, library_empty).is_some());
    controller.cancel();

    rig.enroll_search("bright", 250)?;
    let (setup, events, _stats) = rig.setup(128);
    let mut controller = FlowController::search(setup, &SearchSettings::default())?;
    let no_match = |e: &FlowEvent| {
        matches!(
            e,
            FlowEvent::Intent {
                intent: UiIntent::Primary {
                    hint: Hint::NoMatch,
                    ..
                },
                ..
            }
        )
    };
    assert!(wait_event(&mut controller, &events, no_match).is_some());
    Ok(())
}

#[test]
fn search_with_liveness_prompts_before_matching() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_search("bob", 128)?;
    let (setup, events, _stats) = rig.setup(128);
    let settings = SearchSettings {
        one_time: true,
        require_liveness: true,
        ..SearchSettings::default()
    };
    let mut controller = FlowController::search(setup, &settings)?;

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::Success);

    let events: Vec<FlowEvent> = events.try_iter().collect();
    let blink = events
        .iter()
        .position(|e| {
            matches!(
                e,
                FlowEvent::Intent {
                    intent: UiIntent::Primary {
                        hint: Hint::Blink,
                        ..
                    },
                    ..
                }
            )
        })
        .expect("blink prompt");
    let matched = events
        .iter()
        .position(|e| matches!(e, FlowEvent::MostSimilar { .. }))
        .expect("match");
    assert!(blink < matched);
    Ok(())
}

/// Never sees a live face.
struct SpoofedEngine;

impl FaceEngine for SpoofedEngine {
    fn name(&self) -> &'static str {
        "spoofed"
    }

    fn detect(&mut self, _frame: FrameView<'_>, _kind: FlowKind) -> Result<EngineOutcome> {
        Ok(EngineOutcome::Tip(SearchTip::NoLiveFace.code()))
    }
}

#[test]
fn search_without_a_live_face_aborts_with_liveness_timeout() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_search("bob", 128)?;
    let (mut setup, _events, stats) = rig.setup(128);
    setup.engine = Arc::new(Mutex::new(SpoofedEngine));
    let settings = SearchSettings {
        require_liveness: true,
        ..SearchSettings::default()
    };
    let mut controller = FlowController::search(setup, &settings)?;

    let result = wait_finished(&mut controller);
    assert_eq!(result.code, ResultCode::LivenessTimeout);
    assert!(stats.released.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[test]
fn paused_flow_handles_no_reports() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 128)?;
    let (setup, events, stats) = rig.setup(10);
    let mut controller = FlowController::verification(setup, "alice", &no_liveness())?;

    assert!(wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::Intent { .. })).is_some());
    controller.pause();
    // Reports raised before the pause are discarded by generation.
    controller.pump(Duration::from_millis(20));
    let handled = controller.reports_handled();
    let captured = stats.frames_captured.load(Ordering::SeqCst);
    let until = Instant::now() + Duration::from_millis(100);
    while Instant::now() < until {
        controller.pump(Duration::from_millis(10));
    }
    assert_eq!(controller.reports_handled(), handled);
    assert!(stats.frames_captured.load(Ordering::SeqCst) > captured);

    controller.resume();
    let until = Instant::now() + WAIT;
    while controller.reports_handled() == handled && Instant::now() < until {
        controller.pump(Duration::from_millis(10));
    }
    assert!(controller.reports_handled() > handled);
    Ok(())
}

#[test]
fn cancel_tears_down_and_later_calls_are_ignored() -> Result<()> {
    let rig = Rig::new()?;
    rig.enroll_verify("alice", 128)?;
    let (setup, events, stats) = rig.setup(10);
    let session = setup.session.clone();
    let mut controller = FlowController::verification(setup, "alice", &no_liveness())?;

    let ticket = match wait_event(&mut controller, &events, |e| matches!(e, FlowEvent::Intent { .. })) {
        Some(FlowEvent::Intent { ticket, .. }) => ticket,
        other => panic!("expected an intent, got {:?}", other),
    };
    controller.cancel();
    controller.cancel();

    assert_eq!(session.state(), SessionState::Unbound);
    assert!(!controller.acknowledge_dialog(ticket, DialogChoice::Retry));
    assert!(!controller.reject_enrollment());
    assert_eq!(
        controller.pump(Duration::from_millis(10)).map(|r| r.code),
        Some(ResultCode::UserCancelled)
    );
    let finished = events
        .try_iter()
        .filter(|e| matches!(e, FlowEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);
    assert_eq!(
        stats.frames_released.load(Ordering::SeqCst),
        stats.frames_captured.load(Ordering::SeqCst)
    );
    Ok(())
}

#[test]
fn flows_require_a_bound_session() -> Result<()> {
    let rig = Rig::new()?;
    let (mut setup, _events, _stats) = rig.setup(128);
    setup.session = Arc::new(CaptureSession::new());
    assert!(FlowController::search(setup, &SearchSettings::default()).is_err());
    Ok(())
}
