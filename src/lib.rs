//! Face capture orchestration kernel.
//!
//! This crate implements the orchestration layer around an opaque face engine.
//! The engine itself, the persistent stores and the UI are collaborators that
//! plug in through traits.
//!
//! # Architecture
//!
//! 1. **Lens resolution**: pick a capture device from an unreliable inventory
//!    (exact facing, opposite facing, then anything).
//! 2. **Frame gating**: a capture session forwards frames to the engine only
//!    while its gate is open. Closed-gate frames are released, never queued.
//! 3. **Sequential ingestion**: a batch of still images is drained through the
//!    extractor with at most one item in flight.
//! 4. **Tips and retries**: engine tip codes map to UI intents; terminal
//!    failures consume a bounded retry budget per flow.
//!
//! # Module Structure
//!
//! - `lens`, `source`: device inventory and the platform camera subsystem
//! - `frame`, `gate`, `session`: frame buffers and the capture state machine
//! - `detect`: engine boundary (detector, extractor, comparator) and stub engine
//! - `tips`, `retry`: tip dispatch and retry budget
//! - `ingest`: sequential face import pipeline
//! - `storage`: feature stores and face image persistence
//! - `flow`: verification, search, enrollment and liveness controllers

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod error;
pub mod flow;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod lens;
pub mod retry;
pub mod session;
pub mod source;
pub mod storage;
pub mod tips;
pub mod ui;

pub use config::{KernelConfig, StoragePaths};
pub use detect::{
    EngineOutcome, EngineRegistry, FaceCapture, FaceEngine, FeatureComparator, FeatureExtractor,
    LivenessType, PerformanceMode, SharedEngine, StubEngine, StubExtractor,
};
pub use error::FlowError;
pub use flow::{
    DialogChoice, EnrollTarget, FlowController, FlowEvent, FlowResult, FlowServices, FlowSetup,
};
pub use frame::{DualFramePair, DualFrameSlot, Frame, FrameView, Spectrum};
pub use gate::{FrameGate, GateHold};
pub use ingest::{IngestionItem, IngestionPipeline, IngestionTally, SourceRef};
pub use lens::{resolve, DeviceDescriptor, LensFacing};
pub use retry::{RetryCoordinator, RetryDecision, TerminalFailure};
pub use session::{CameraSlot, CaptureSession, FrameDisposition, FrameWorker, SessionState};
pub use source::{CameraPlatform, DeviceBinding, SyntheticPlatform};
pub use storage::{
    FaceImageStore, FaceLibrary, FeatureStore, FsFaceImageStore, ImageDir, InMemoryFeatureStore,
    InMemorySearchIndex, SearchIndex, SearchMatch, SearchRecord, SqliteFeatureStore,
    SqliteSearchIndex,
};
pub use tips::{DispatchTicket, Hint, TipDispatcher, UiIntent};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:faceflow_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Labels name features in the stores and files in the image directories, so
/// anything that could escape the directory is refused. Spaces and non-ASCII
/// names (as taken from photo file names) are fine.
///
/// Allowed: "alice", "emp-0042", "John Smith", "张三"
/// Disallowed: empty, leading dot or whitespace, path separators, control
/// characters, more than 128 characters.
pub fn validate_label(label: &str) -> Result<()> {
    static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = LABEL_RE.get_or_init(|| {
        regex::Regex::new(r"^[^./\\\s\p{Cc}][^/\\\p{Cc}]{0,127}$").expect("label pattern")
    });
    if !re.is_match(label) {
        return Err(anyhow!(
            "label {:?} must be 1-128 characters without path separators, control \
             characters or a leading dot",
            label
        ));
    }
    Ok(())
}

// -------------------- Flow kinds and result codes --------------------

/// The independent flows a host can run. Each owns its own retry budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Verification,
    Search,
    Enrollment,
    Liveness,
}

impl FlowKind {
    pub const ALL: [FlowKind; 4] = [
        FlowKind::Verification,
        FlowKind::Search,
        FlowKind::Enrollment,
        FlowKind::Liveness,
    ];

    /// Event name reported to the host bridge.
    pub fn event_name(self) -> &'static str {
        match self {
            FlowKind::Verification => "Verified",
            FlowKind::Search => "Searched",
            FlowKind::Enrollment => "Enrolled",
            FlowKind::Liveness => "LivenessChecked",
        }
    }
}

/// Machine-checkable result codes returned to the host when a flow ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    UserCancelled = 0,
    Success = 1,
    VerifyMismatch = 2,
    LivenessTimeout = 3,
    MotionTimeout = 4,
    NoFaceRepeatedly = 5,
    NoFaceFeature = 6,
    LivenessColorFlashFailed = 7,
    ColorFlashFailed = 8,
    LightTooHigh = 9,
    LivenessDone = 10,
    CameraUnavailable = 100,
    Unknown = 999,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ResultCode::UserCancelled,
            1 => ResultCode::Success,
            2 => ResultCode::VerifyMismatch,
            3 => ResultCode::LivenessTimeout,
            4 => ResultCode::MotionTimeout,
            5 => ResultCode::NoFaceRepeatedly,
            6 => ResultCode::NoFaceFeature,
            7 => ResultCode::LivenessColorFlashFailed,
            8 => ResultCode::ColorFlashFailed,
            9 => ResultCode::LightTooHigh,
            10 => ResultCode::LivenessDone,
            100 => ResultCode::CameraUnavailable,
            _ => ResultCode::Unknown,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::LivenessDone)
    }

    /// Human-readable reason shown alongside a terminal result.
    pub fn reason(self) -> &'static str {
        match self {
            ResultCode::UserCancelled => "cancelled by user",
            ResultCode::Success => "success",
            ResultCode::VerifyMismatch => "face does not match the enrolled face",
            ResultCode::LivenessTimeout => "liveness detection timed out",
            ResultCode::MotionTimeout => "motion liveness timed out",
            ResultCode::NoFaceRepeatedly => "no face detected repeatedly",
            ResultCode::NoFaceFeature => "no enrolled face feature",
            ResultCode::LivenessColorFlashFailed => "color flash liveness failed",
            ResultCode::ColorFlashFailed => "color flash liveness failed",
            ResultCode::LightTooHigh => "ambient light too strong for color flash",
            ResultCode::LivenessDone => "liveness detection done",
            ResultCode::CameraUnavailable => "no usable camera",
            ResultCode::Unknown => "unknown error",
        }
    }
}
