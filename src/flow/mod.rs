//! Flow controllers.
//!
//! A `FlowController` drives one verification, search, enrollment or
//! liveness flow over a bound `CaptureSession`. It consumes frame reports
//! from the session's worker, routes tip codes through the `TipDispatcher`,
//! spends the flow's retry budget on terminal failures and reports
//! everything to the host as `FlowEvent`s. All controller methods run on the
//! host's thread; only the frame worker runs elsewhere.

use serde::ser::{Serialize, Serializer};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::detect::{FaceCapture, FeatureComparator, FeatureExtractor, SharedEngine};
use crate::session::CaptureSession;
use crate::storage::FaceLibrary;
use crate::tips::{DispatchTicket, UiIntent};
use crate::{FlowKind, ResultCode};

mod controller;
mod enroll;
mod liveness;
mod search;
mod verify;

pub use controller::FlowController;
pub use enroll::EnrollTarget;

/// What the host sees while a flow runs.
#[derive(Clone, Debug)]
pub enum FlowEvent {
    /// First frame dimensions, reported once per session.
    FrameSize { width: u32, height: u32 },
    Intent {
        ticket: DispatchTicket,
        intent: UiIntent,
    },
    /// Best search match above the threshold.
    MostSimilar { label: String, similarity: f32 },
    /// Enrollment captured a face and waits for `confirm_enrollment` or
    /// `reject_enrollment`. Frame delivery is paused meanwhile.
    ConfirmFace { quality: f32 },
    /// A captured face could not be used; the flow keeps going.
    Rejected { reason: String },
    Finished(FlowResult),
}

/// Terminal result of a flow.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowResult {
    pub kind: FlowKind,
    pub code: ResultCode,
    pub message: String,
    pub label: Option<String>,
    pub similarity: Option<f32>,
    pub feature: Option<String>,
}

impl FlowResult {
    pub fn new(kind: FlowKind, code: ResultCode) -> Self {
        Self {
            kind,
            code,
            message: code.reason().to_string(),
            label: None,
            similarity: None,
            feature: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

#[derive(serde::Serialize)]
struct FlowResultWire<'a> {
    event: &'static str,
    code: i32,
    result: bool,
    #[serde(rename = "faceID", skip_serializing_if = "Option::is_none")]
    face_id: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f32>,
}

/// Serialises to the host bridge's event shape:
/// `{"event":"Verified","code":1,"result":true,"faceID":"alice","message":"success","similarity":0.93}`.
/// Features are never serialised.
impl Serialize for FlowResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FlowResultWire {
            event: self.kind.event_name(),
            code: self.code.code(),
            result: self.is_success(),
            face_id: self.label.as_deref(),
            message: &self.message,
            similarity: self.similarity,
        }
        .serialize(serializer)
    }
}

/// Host's answer to a dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogChoice {
    Retry,
    Dismiss,
}

/// Collaborators shared by every flow.
#[derive(Clone)]
pub struct FlowServices {
    pub library: Arc<FaceLibrary>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub comparator: Arc<dyn FeatureComparator>,
}

/// Everything a controller needs besides its flow-specific settings.
pub struct FlowSetup {
    pub session: Arc<CaptureSession>,
    pub engine: SharedEngine,
    pub services: FlowServices,
    pub events: Sender<FlowEvent>,
}

/// What a flow handler asks the controller to do.
pub(crate) enum FaceStep {
    Tip(i32),
    Event(FlowEvent),
    AwaitConfirm(FaceCapture),
    Mismatch { similarity: f32 },
    Finish(FlowResult),
}

/// Flow-specific reaction to captured faces.
pub(crate) trait FlowHandler: Send {
    /// Runs once before the frame worker starts.
    fn start(&mut self, _services: &FlowServices) -> anyhow::Result<Vec<FaceStep>> {
        Ok(Vec::new())
    }

    fn on_face(&mut self, capture: FaceCapture, services: &FlowServices) -> Vec<FaceStep>;

    /// Host accepted a face awaiting confirmation.
    fn on_confirm(
        &mut self,
        _capture: FaceCapture,
        _label: Option<&str>,
        _services: &FlowServices,
    ) -> Vec<FaceStep> {
        Vec::new()
    }

    /// A retry is about to reopen the gate.
    fn on_retry(&mut self) {}
}
