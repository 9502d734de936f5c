//! Capture session lifecycle.
//!
//! ```text
//!  Initializing --bind ok--> Bound --teardown--> Unbound
//!       |
//!       +--bind err--> Failed
//! ```
//!
//! A session owns one device binding and one frame gate. Frames are pulled by
//! a single `FrameWorker` thread and either forwarded to the engine (gate
//! open) or released on the spot (gate closed). `CameraSlot` keeps at most
//! one bound session per camera.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::CameraSettings;
use crate::detect::{EngineOutcome, SharedEngine};
use crate::error::FlowError;
use crate::frame::{DualFrameSlot, Frame, Spectrum};
use crate::gate::{FrameGate, GateHold};
use crate::lens::{self, DeviceDescriptor, LensFacing};
use crate::source::{CameraPlatform, DeviceBinding};
use crate::FlowKind;

/// Worker back-off while the gate is closed, so a paused session does not spin.
const CLOSED_GATE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Bound,
    Unbound,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmDecision {
    Accepted,
    Rejected,
}

/// Result of handing one frame to the session.
#[derive(Debug)]
pub enum FrameDisposition {
    /// Gate closed; the frame was released without reaching the engine.
    Dropped,
    /// Half of a dual-sensor pair, held until its partner arrives.
    Buffered,
    /// The engine ran on the frame under gate `generation`.
    Forwarded {
        generation: u64,
        outcome: Result<EngineOutcome>,
    },
}

pub type SizeListener = Box<dyn FnOnce(u32, u32) + Send>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CaptureSession {
    state: Mutex<SessionState>,
    device: OnceLock<DeviceDescriptor>,
    binding: Mutex<Option<Box<dyn DeviceBinding>>>,
    gate: FrameGate,
    frame_size: OnceLock<(u32, u32)>,
    size_listener: Mutex<Option<SizeListener>>,
    dual_slot: Mutex<DualFrameSlot>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Initializing),
            device: OnceLock::new(),
            binding: Mutex::new(None),
            gate: FrameGate::new(),
            frame_size: OnceLock::new(),
            size_listener: Mutex::new(None),
            dual_slot: Mutex::new(DualFrameSlot::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.get()
    }

    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    /// Dimensions of the first frame this session saw.
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size.get().copied()
    }

    /// Enumerate devices, resolve `preferred` and open the chosen device.
    pub fn bind(
        &self,
        platform: &dyn CameraPlatform,
        preferred: LensFacing,
        settings: &CameraSettings,
    ) -> Result<DeviceDescriptor, FlowError> {
        let mut state = lock(&self.state);
        if *state != SessionState::Initializing {
            return Err(FlowError::SessionState {
                state: *state,
                expected: SessionState::Initializing,
            });
        }

        let outcome = platform
            .enumerate()
            .map_err(|err| FlowError::DeviceBind {
                device: format!("{} inventory", platform.name()),
                reason: err.to_string(),
            })
            .and_then(|devices| lens::resolve(preferred, &devices))
            .and_then(|device| {
                platform
                    .open(&device, settings)
                    .map(|binding| (device.clone(), binding))
                    .map_err(|err| FlowError::DeviceBind {
                        device: device.id.clone(),
                        reason: err.to_string(),
                    })
            });

        match outcome {
            Ok((device, binding)) => {
                *lock(&self.binding) = Some(binding);
                let _ = self.device.set(device.clone());
                *state = SessionState::Bound;
                log::info!("capture session bound to {} ({})", device.id, device.facing);
                Ok(device)
            }
            Err(err) => {
                *state = SessionState::Failed;
                log::error!("capture session failed to start: {}", err);
                Err(err)
            }
        }
    }

    /// Close the gate for good and release the device. Idempotent.
    pub fn teardown(&self) {
        self.gate.close(GateHold::TornDown);
        lock(&self.dual_slot).clear();
        if let Some(mut binding) = lock(&self.binding).take() {
            if let Err(err) = binding.release() {
                log::warn!("failed to release {}: {}", binding.device().id, err);
            }
        }
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Bound | SessionState::Initializing) {
            *state = SessionState::Unbound;
            log::info!("capture session unbound");
        }
    }

    pub fn pause(&self) {
        self.gate.close(GateHold::Paused);
        lock(&self.dual_slot).clear();
    }

    pub fn resume(&self) {
        self.gate.open(GateHold::Paused);
    }

    pub fn enter_confirmation(&self) {
        self.gate.close(GateHold::Confirming);
        lock(&self.dual_slot).clear();
    }

    /// Rejecting reopens the gate; accepting ends the session.
    pub fn leave_confirmation(&self, decision: ConfirmDecision) {
        match decision {
            ConfirmDecision::Rejected => {
                self.gate.open(GateHold::Confirming);
            }
            ConfirmDecision::Accepted => self.teardown(),
        }
    }

    /// Register the one-shot frame size listener. If a frame already arrived
    /// the listener fires immediately.
    pub fn set_size_listener<F>(&self, listener: F)
    where
        F: FnOnce(u32, u32) + Send + 'static,
    {
        if let Some((width, height)) = self.frame_size() {
            listener(width, height);
            return;
        }
        *lock(&self.size_listener) = Some(Box::new(listener));
        // A frame may have latched between the check and the store.
        if let Some((width, height)) = self.frame_size() {
            if let Some(listener) = lock(&self.size_listener).take() {
                listener(width, height);
            }
        }
    }

    fn latch_size(&self, frame: &Frame) {
        if self.frame_size.set((frame.width, frame.height)).is_ok() {
            log::debug!("frame size latched at {}x{}", frame.width, frame.height);
            if let Some(listener) = lock(&self.size_listener).take() {
                listener(frame.width, frame.height);
            }
        }
    }

    /// True when an outcome produced under `generation` may still be acted on.
    pub fn accepts(&self, generation: u64) -> bool {
        self.gate.is_open() && self.gate.generation() == generation
    }

    /// Forward `frame` to the engine if the gate is open. The frame is
    /// released when this returns, on either path.
    pub fn deliver(&self, frame: Frame, engine: &SharedEngine, kind: FlowKind) -> FrameDisposition {
        self.latch_size(&frame);
        let forwarded = self.gate.forward(|| {
            let mut engine = engine
                .lock()
                .map_err(|_| anyhow!("face engine lock poisoned"))?;
            engine.detect(frame.view(), kind)
        });
        drop(frame);
        match forwarded {
            Some((generation, outcome)) => FrameDisposition::Forwarded {
                generation,
                outcome,
            },
            None => FrameDisposition::Dropped,
        }
    }

    /// Dual-sensor path: pair RGB and infrared frames, then forward the pair.
    pub fn deliver_spectrum(
        &self,
        spectrum: Spectrum,
        frame: Frame,
        engine: &SharedEngine,
        kind: FlowKind,
    ) -> FrameDisposition {
        if spectrum == Spectrum::Rgb {
            self.latch_size(&frame);
        }
        // The slot lock spans the open check and the offer, so a hold that
        // clears the slot cannot interleave and leave a stale half-pair behind.
        let pair = {
            let mut slot = lock(&self.dual_slot);
            if !self.gate.is_open() {
                slot.clear();
                return FrameDisposition::Dropped;
            }
            slot.offer(spectrum, frame)
        };
        let Some(pair) = pair else {
            return FrameDisposition::Buffered;
        };
        let forwarded = self.gate.forward(|| {
            let mut engine = engine
                .lock()
                .map_err(|_| anyhow!("face engine lock poisoned"))?;
            engine.detect_dual(pair.rgb.view(), pair.ir.view(), kind)
        });
        drop(pair);
        match forwarded {
            Some((generation, outcome)) => FrameDisposition::Forwarded {
                generation,
                outcome,
            },
            None => FrameDisposition::Dropped,
        }
    }

    /// Pull the next frame from the bound device. `None` once torn down.
    pub fn next_frame(&self) -> Result<Option<(Spectrum, Frame)>> {
        let mut binding = lock(&self.binding);
        match binding.as_mut() {
            Some(binding) => binding.next_frame().map(Some),
            None => Ok(None),
        }
    }

    pub fn is_dual(&self) -> bool {
        lock(&self.binding)
            .as_ref()
            .map(|binding| binding.is_dual())
            .unwrap_or(false)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ----------------------------------------------------------------------------
// CameraSlot: one bound session per camera
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct CameraSlot {
    current: Mutex<Option<Arc<CaptureSession>>>,
}

impl CameraSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down the current session (if any), then start and bind a new one.
    pub fn bind(
        &self,
        platform: &dyn CameraPlatform,
        preferred: LensFacing,
        settings: &CameraSettings,
    ) -> Result<Arc<CaptureSession>, FlowError> {
        let mut current = lock(&self.current);
        if let Some(previous) = current.take() {
            previous.teardown();
        }
        let session = Arc::new(CaptureSession::new());
        session.bind(platform, preferred, settings)?;
        *current = Some(session.clone());
        Ok(session)
    }

    pub fn current(&self) -> Option<Arc<CaptureSession>> {
        lock(&self.current).clone()
    }

    pub fn release(&self) {
        if let Some(session) = lock(&self.current).take() {
            session.teardown();
        }
    }
}

// ----------------------------------------------------------------------------
// FrameWorker: the single frame-analysis thread
// ----------------------------------------------------------------------------

/// Engine outcome for one forwarded frame, posted to the flow controller.
#[derive(Debug)]
pub struct FrameReport {
    pub generation: u64,
    pub outcome: Result<EngineOutcome>,
}

pub struct FrameWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameWorker {
    pub fn spawn(
        session: Arc<CaptureSession>,
        engine: SharedEngine,
        kind: FlowKind,
        reports: Sender<FrameReport>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let dual = session.is_dual();
            while !stop.load(Ordering::SeqCst) {
                let (spectrum, frame) = match session.next_frame() {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(err) => {
                        if session.state() == SessionState::Bound {
                            log::warn!("frame capture failed: {}", err);
                        }
                        break;
                    }
                };
                let disposition = if dual {
                    session.deliver_spectrum(spectrum, frame, &engine, kind)
                } else {
                    session.deliver(frame, &engine, kind)
                };
                match disposition {
                    FrameDisposition::Forwarded {
                        generation,
                        outcome,
                    } => {
                        if reports.send(FrameReport { generation, outcome }).is_err() {
                            break;
                        }
                    }
                    FrameDisposition::Dropped => std::thread::sleep(CLOSED_GATE_BACKOFF),
                    FrameDisposition::Buffered => {}
                }
            }
            log::debug!("frame worker exiting");
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("frame worker panicked");
            }
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
