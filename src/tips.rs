//! Tip dispatch.
//!
//! Engines report guidance and failures as integer tip codes. Each flow kind
//! has its own code space; `TipDispatcher::dispatch` maps every code to a
//! `UiIntent` and never fails. Codes outside the flow's space come back as
//! `UiIntent::Unhandled` so the host can show the raw value.
//!
//! Every dispatch returns a ticket. Only the most recent ticket is current;
//! a host that acts on a dialog must present its ticket and is ignored when
//! a newer tip superseded it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::retry::TerminalFailure;
use crate::{FlowKind, ResultCode};

macro_rules! tip_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

tip_codes! {
    /// Tips raised during 1:1 verification and standalone liveness.
    VerifyTip {
        FaceTooSmall = 3,
        FaceTooLarge = 4,
        FaceSizeFit = 5,
        ActionNoFace = 6,
        NoFaceRepeatedly = 7,
        PauseVerify = 8,
        IrImageNull = 9,
        IrLiveFailed = 10,
        LightTooHigh = 11,
        MotionLiveSuccess = 20,
        ActionProcess = 21,
        OpenMouth = 22,
        Smile = 23,
        Blink = 24,
        ShakeHead = 25,
        NodHead = 26,
        MotionLiveTimeout = 27,
        ColorFlashLiveSuccess = 31,
        ColorFlashLiveFailed = 32,
        ColorFlashNeedCloser = 33,
    }
}

tip_codes! {
    /// Tips raised during 1:N search.
    SearchTip {
        NoMatched = 40,
        FaceDirEmpty = 41,
        EngineIniting = 42,
        SearchPrepared = 43,
        Searching = 44,
        NoLiveFace = 45,
        FaceTooSmall = 46,
        FaceTooLarge = 47,
        FaceSizeFit = 48,
        TooManyFaces = 49,
        ThresholdError = 50,
        MaskDetected = 51,
    }
}

tip_codes! {
    /// Tips raised while capturing a face for enrollment.
    EnrollTip {
        NoFaceRepeatedly = 60,
        FaceTooSmall = 61,
        FaceTooLarge = 62,
        CloseEye = 63,
        HeadCenter = 64,
        TiltHead = 65,
        HeadLeft = 66,
        HeadRight = 67,
        HeadUp = 68,
        HeadDown = 69,
    }
}

/// Message keys for the host's localized strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hint {
    MoveCloser,
    MoveAway,
    KeepStill,
    NoFace,
    NoFaceRepeatedly,
    Paused,
    ActionInProgress,
    OpenMouth,
    Smile,
    Blink,
    ShakeHead,
    NodHead,
    MotionLivenessPassed,
    MotionLivenessTimeout,
    ColorFlashPassed,
    ColorFlashFailed,
    LightTooHigh,
    InfraredMissing,
    InfraredLivenessFailed,
    NoMatch,
    VerifyMismatch,
    LibraryEmpty,
    EngineStarting,
    SearchReady,
    Searching,
    NoLiveFace,
    TooManyFaces,
    ThresholdInvalid,
    RemoveMask,
    OpenEyes,
    CenterHead,
    StraightenHead,
    TurnLeft,
    TurnRight,
    LookUp,
    LookDown,
}

/// Audio cue the host may play with a primary hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cue {
    OpenMouth,
    Smile,
    Blink,
    ShakeHead,
    NodHead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogAction {
    /// Terminal liveness failure: the user may retry; the retry budget decides.
    RetryOrAbort(TerminalFailure),
    /// Non-terminal failure (e.g. face mismatch): retry without spending the
    /// budget, or finish with this code.
    RetryOrFinish(ResultCode),
    /// Informational: acknowledging finishes the flow with this code.
    Acknowledge(ResultCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiIntent {
    Primary { hint: Hint, cue: Option<Cue> },
    /// Secondary line; `None` clears it.
    Secondary(Option<Hint>),
    Dialog { hint: Hint, action: DialogAction },
    /// End the flow immediately.
    Abort(ResultCode),
    Unhandled(i32),
}

impl UiIntent {
    pub fn terminal_failure(&self) -> Option<TerminalFailure> {
        match self {
            UiIntent::Dialog {
                action: DialogAction::RetryOrAbort(failure),
                ..
            } => Some(*failure),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchTicket(u64);

pub struct TipDispatcher {
    kind: FlowKind,
    /// Liveness-only search finishes when no live face is found.
    search_requires_liveness: bool,
    latest: AtomicU64,
}

impl TipDispatcher {
    pub fn new(kind: FlowKind) -> Self {
        Self {
            kind,
            search_requires_liveness: false,
            latest: AtomicU64::new(0),
        }
    }

    pub fn with_search_liveness(mut self, enabled: bool) -> Self {
        self.search_requires_liveness = enabled;
        self
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// Map `code` to an intent and supersede every earlier ticket.
    pub fn dispatch(&self, code: i32) -> (DispatchTicket, UiIntent) {
        let ticket = DispatchTicket(self.latest.fetch_add(1, Ordering::SeqCst) + 1);
        let intent = self.map(code);
        if let UiIntent::Unhandled(code) = intent {
            log::debug!("{:?} flow: unhandled tip code {}", self.kind, code);
        }
        (ticket, intent)
    }

    pub fn is_current(&self, ticket: DispatchTicket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.0
    }

    /// Issue a ticket for an intent raised by the controller itself
    /// (e.g. a verification mismatch dialog). Supersedes earlier tickets.
    pub(crate) fn issue(&self) -> DispatchTicket {
        DispatchTicket(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn map(&self, code: i32) -> UiIntent {
        match self.kind {
            FlowKind::Verification | FlowKind::Liveness => VerifyTip::from_code(code)
                .map(verify_intent)
                .unwrap_or(UiIntent::Unhandled(code)),
            FlowKind::Search => {
                if let Some(tip) = SearchTip::from_code(code) {
                    return self.search_intent(tip);
                }
                // Search with liveness shares the verification prompts and
                // failure codes.
                VerifyTip::from_code(code)
                    .map(verify_intent)
                    .unwrap_or(UiIntent::Unhandled(code))
            }
            FlowKind::Enrollment => EnrollTip::from_code(code)
                .map(enroll_intent)
                .unwrap_or(UiIntent::Unhandled(code)),
        }
    }

    fn search_intent(&self, tip: SearchTip) -> UiIntent {
        match tip {
            SearchTip::NoMatched => UiIntent::Primary {
                hint: Hint::NoMatch,
                cue: None,
            },
            SearchTip::FaceDirEmpty => UiIntent::Primary {
                hint: Hint::LibraryEmpty,
                cue: None,
            },
            SearchTip::EngineIniting => UiIntent::Primary {
                hint: Hint::EngineStarting,
                cue: None,
            },
            SearchTip::SearchPrepared => UiIntent::Primary {
                hint: Hint::SearchReady,
                cue: None,
            },
            SearchTip::Searching => UiIntent::Primary {
                hint: Hint::Searching,
                cue: None,
            },
            SearchTip::NoLiveFace => {
                if self.search_requires_liveness {
                    UiIntent::Abort(ResultCode::LivenessTimeout)
                } else {
                    UiIntent::Primary {
                        hint: Hint::NoLiveFace,
                        cue: None,
                    }
                }
            }
            SearchTip::FaceTooSmall => UiIntent::Secondary(Some(Hint::MoveCloser)),
            SearchTip::FaceTooLarge => UiIntent::Secondary(Some(Hint::MoveAway)),
            SearchTip::FaceSizeFit => UiIntent::Secondary(None),
            SearchTip::TooManyFaces => UiIntent::Primary {
                hint: Hint::TooManyFaces,
                cue: None,
            },
            SearchTip::ThresholdError => UiIntent::Primary {
                hint: Hint::ThresholdInvalid,
                cue: None,
            },
            SearchTip::MaskDetected => UiIntent::Primary {
                hint: Hint::RemoveMask,
                cue: None,
            },
        }
    }
}

fn terminal_verify_tip(tip: VerifyTip) -> Option<TerminalFailure> {
    match tip {
        VerifyTip::ColorFlashLiveFailed => Some(TerminalFailure::ColorFlashFailed),
        VerifyTip::LightTooHigh => Some(TerminalFailure::LightTooHigh),
        VerifyTip::MotionLiveTimeout => Some(TerminalFailure::MotionTimeout),
        _ => None,
    }
}

fn verify_intent(tip: VerifyTip) -> UiIntent {
    if let Some(failure) = terminal_verify_tip(tip) {
        let hint = match failure {
            TerminalFailure::ColorFlashFailed => Hint::ColorFlashFailed,
            TerminalFailure::LightTooHigh => Hint::LightTooHigh,
            TerminalFailure::MotionTimeout => Hint::MotionLivenessTimeout,
        };
        return UiIntent::Dialog {
            hint,
            action: DialogAction::RetryOrAbort(failure),
        };
    }
    let primary = |hint| UiIntent::Primary { hint, cue: None };
    let action = |hint, cue| UiIntent::Primary {
        hint,
        cue: Some(cue),
    };
    match tip {
        VerifyTip::FaceTooSmall => UiIntent::Secondary(Some(Hint::MoveCloser)),
        VerifyTip::FaceTooLarge => UiIntent::Secondary(Some(Hint::MoveAway)),
        VerifyTip::FaceSizeFit => UiIntent::Secondary(None),
        VerifyTip::ActionNoFace => UiIntent::Secondary(Some(Hint::NoFace)),
        VerifyTip::ColorFlashNeedCloser => UiIntent::Secondary(Some(Hint::MoveCloser)),
        VerifyTip::NoFaceRepeatedly => UiIntent::Dialog {
            hint: Hint::NoFaceRepeatedly,
            action: DialogAction::Acknowledge(ResultCode::NoFaceRepeatedly),
        },
        VerifyTip::PauseVerify => UiIntent::Dialog {
            hint: Hint::Paused,
            action: DialogAction::Acknowledge(ResultCode::NoFaceRepeatedly),
        },
        VerifyTip::IrImageNull => primary(Hint::InfraredMissing),
        VerifyTip::IrLiveFailed => primary(Hint::InfraredLivenessFailed),
        VerifyTip::MotionLiveSuccess => primary(Hint::MotionLivenessPassed),
        VerifyTip::ColorFlashLiveSuccess => primary(Hint::ColorFlashPassed),
        VerifyTip::ActionProcess => primary(Hint::ActionInProgress),
        VerifyTip::OpenMouth => action(Hint::OpenMouth, Cue::OpenMouth),
        VerifyTip::Smile => action(Hint::Smile, Cue::Smile),
        VerifyTip::Blink => action(Hint::Blink, Cue::Blink),
        VerifyTip::ShakeHead => action(Hint::ShakeHead, Cue::ShakeHead),
        VerifyTip::NodHead => action(Hint::NodHead, Cue::NodHead),
        VerifyTip::ColorFlashLiveFailed
        | VerifyTip::LightTooHigh
        | VerifyTip::MotionLiveTimeout => UiIntent::Unhandled(tip.code()),
    }
}

fn enroll_intent(tip: EnrollTip) -> UiIntent {
    let primary = |hint| UiIntent::Primary { hint, cue: None };
    match tip {
        EnrollTip::NoFaceRepeatedly => primary(Hint::NoFaceRepeatedly),
        EnrollTip::FaceTooSmall => primary(Hint::MoveCloser),
        EnrollTip::FaceTooLarge => primary(Hint::MoveAway),
        EnrollTip::CloseEye => primary(Hint::OpenEyes),
        EnrollTip::HeadCenter => primary(Hint::CenterHead),
        EnrollTip::TiltHead => primary(Hint::StraightenHead),
        EnrollTip::HeadLeft => primary(Hint::TurnRight),
        EnrollTip::HeadRight => primary(Hint::TurnLeft),
        EnrollTip::HeadUp => primary(Hint::LookDown),
        EnrollTip::HeadDown => primary(Hint::LookUp),
    }
}
