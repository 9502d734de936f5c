//! Frame buffers.
//!
//! - `Frame`: owned RGB24 buffer with a release hook. Bytes are private.
//! - `FrameView`: borrowed view handed to the engine for the duration of one call.
//! - `DualFrameSlot`: pairs an RGB frame with an infrared frame from a dual-sensor camera.
//!
//! A frame is released exactly once: when it is dropped. That covers the
//! forwarded path (dropped after the engine returns) and the gated path
//! (dropped immediately without reaching the engine).

use std::fmt;
use std::time::Instant;
use zeroize::Zeroize;

type ReleaseHook = Box<dyn FnOnce() + Send>;

// ----------------------------------------------------------------------------
// Frame: owned capture buffer
// ----------------------------------------------------------------------------

/// One captured frame. There is no `Clone` and no byte accessor; consumers
/// read pixels through `view()` only.
pub struct Frame {
    /// Private RGB24 pixel data, `width * height * 3` bytes.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Per-binding sequence number, starting at 1.
    pub sequence: u64,

    captured_at: Instant,

    /// Returns the underlying buffer to its producer (e.g. an mmap queue slot).
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
            release: None,
        }
    }

    /// Attach a hook that runs when the frame is released.
    pub fn with_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }

    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Wipe pixels before the buffer goes back to the allocator.
        self.data.zeroize();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ----------------------------------------------------------------------------
// FrameView: borrowed pixels for a single engine call
// ----------------------------------------------------------------------------

/// Borrowed view of a frame. The lifetime ties pixel access to the call that
/// received the view, so an engine cannot keep the buffer past its return.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    /// RGB24 pixels, row-major.
    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }

    /// Mean luminance over the frame, 0..=255. Zero for an empty buffer.
    pub fn mean_luma(&self) -> f32 {
        let pixels = self.pixels();
        let count = pixels.len() / 3;
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = pixels
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]) as u64)
            .sum();
        sum as f32 / count as f32
    }
}

pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

// ----------------------------------------------------------------------------
// Dual-sensor pairing
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Spectrum {
    Rgb,
    Infrared,
}

/// A matched RGB + infrared pair ready for the engine.
#[derive(Debug)]
pub struct DualFramePair {
    pub rgb: Frame,
    pub ir: Frame,
}

/// Accumulates one RGB and one infrared frame. A newer frame of the same
/// spectrum replaces (and releases) the older one; once both are present the
/// pair is handed out and both slots reset together.
#[derive(Debug, Default)]
pub struct DualFrameSlot {
    rgb: Option<Frame>,
    ir: Option<Frame>,
}

impl DualFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, spectrum: Spectrum, frame: Frame) -> Option<DualFramePair> {
        match spectrum {
            Spectrum::Rgb => self.rgb = Some(frame),
            Spectrum::Infrared => self.ir = Some(frame),
        }
        if self.rgb.is_some() && self.ir.is_some() {
            let rgb = self.rgb.take()?;
            let ir = self.ir.take()?;
            return Some(DualFramePair { rgb, ir });
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.rgb.is_none() && self.ir.is_none()
    }

    /// Release any half-filled pair.
    pub fn clear(&mut self) {
        self.rgb = None;
        self.ir = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_frame(counter: &Arc<AtomicUsize>, seq: u64) -> Frame {
        let counter = counter.clone();
        Frame::new(vec![10u8; 4 * 4 * 3], 4, 4, seq).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn release_hook_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = counted_frame(&released, 1);
        assert_eq!(frame.view().pixels().len(), 48);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn view_reports_dimensions_and_luma() {
        let frame = Frame::new(vec![255u8; 2 * 2 * 3], 2, 2, 7);
        let view = frame.view();
        assert_eq!(view.width(), 2);
        assert_eq!(view.height(), 2);
        assert_eq!(view.sequence(), 7);
        assert!(view.mean_luma() > 250.0);
    }

    #[test]
    fn dual_slot_pairs_and_resets_both() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut slot = DualFrameSlot::new();

        assert!(slot
            .offer(Spectrum::Rgb, counted_frame(&released, 1))
            .is_none());
        // A second RGB frame replaces the first one, which is released.
        assert!(slot
            .offer(Spectrum::Rgb, counted_frame(&released, 2))
            .is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let pair = slot
            .offer(Spectrum::Infrared, counted_frame(&released, 3))
            .expect("pair once both spectra arrived");
        assert_eq!(pair.rgb.sequence, 2);
        assert_eq!(pair.ir.sequence, 3);
        assert!(slot.is_empty());

        drop(pair);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }
}
