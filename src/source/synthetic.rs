//! Synthetic camera platform (`stub://` devices) for tests and demos.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{CameraPlatform, DeviceBinding, FrameShaper};
use crate::config::CameraSettings;
use crate::frame::{Frame, Spectrum};
use crate::lens::{DeviceDescriptor, LensFacing};

/// Counters shared between the platform and every binding it opened.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub frames_captured: AtomicU64,
    pub frames_released: AtomicU64,
}

pub struct SyntheticPlatform {
    devices: Vec<DeviceDescriptor>,
    /// Per-frame uniform brightness, cycled. `None` renders a moving pattern.
    levels: Option<Arc<Vec<u8>>>,
    dual: bool,
    fail_open: bool,
    pacing: Option<Duration>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticPlatform {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            levels: None,
            dual: false,
            fail_open: false,
            pacing: None,
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    pub fn with_device(facing: LensFacing, id: String) -> Self {
        Self::new(vec![DeviceDescriptor::new(facing, id)])
    }

    pub fn single(facing: LensFacing) -> Self {
        Self::with_device(facing, format!("stub://{}_camera", facing))
    }

    /// Frames become uniform images whose brightness cycles through `levels`.
    pub fn with_levels(mut self, levels: Vec<u8>) -> Self {
        self.levels = if levels.is_empty() {
            None
        } else {
            Some(Arc::new(levels))
        };
        self
    }

    /// Emit alternating RGB and infrared frames.
    pub fn with_dual(mut self, dual: bool) -> Self {
        self.dual = dual;
        self
    }

    /// Every `open` fails, as with a permission denial.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Sleep between frames to approximate the configured frame rate.
    pub fn with_pacing(mut self, target_fps: u32) -> Self {
        self.pacing = (target_fps > 0).then(|| Duration::from_millis(1000 / target_fps as u64));
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }
}

impl CameraPlatform for SyntheticPlatform {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        settings: &CameraSettings,
    ) -> Result<Box<dyn DeviceBinding>> {
        if self.fail_open {
            return Err(anyhow!("permission denied opening {}", device.id));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let (width, height) = settings.capture_size();
        let shaper = FrameShaper::new(settings);
        log::info!(
            "SyntheticPlatform: bound {} ({}x{} @ {} fps, zoom {:.1}x, rotation {})",
            device.id,
            width,
            height,
            settings.target_fps,
            settings.zoom_ratio(),
            settings.rotation
        );
        Ok(Box::new(SyntheticBinding {
            device: device.clone(),
            width,
            height,
            shaper,
            levels: self.levels.clone(),
            dual: self.dual,
            pacing: self.pacing,
            frame_count: 0,
            scene_state: 0,
            released: false,
            stats: self.stats.clone(),
        }))
    }
}

struct SyntheticBinding {
    device: DeviceDescriptor,
    /// Sensor dimensions, before rotation.
    width: u32,
    height: u32,
    shaper: FrameShaper,
    levels: Option<Arc<Vec<u8>>>,
    dual: bool,
    pacing: Option<Duration>,
    frame_count: u64,
    /// Simulated scene state; shifts the pattern every 50 frames.
    scene_state: u8,
    released: bool,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBinding {
    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        if let Some(levels) = &self.levels {
            let level = levels[((self.frame_count - 1) as usize) % levels.len()];
            return vec![level; pixel_count];
        }

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl DeviceBinding for SyntheticBinding {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn is_dual(&self) -> bool {
        self.dual
    }

    fn next_frame(&mut self) -> Result<(Spectrum, Frame)> {
        if self.released {
            return Err(anyhow!("device {} already released", self.device.id));
        }
        if let Some(pacing) = self.pacing {
            std::thread::sleep(pacing);
        }
        self.frame_count += 1;
        self.stats.frames_captured.fetch_add(1, Ordering::SeqCst);

        let spectrum = if self.dual && self.frame_count % 2 == 0 {
            Spectrum::Infrared
        } else {
            Spectrum::Rgb
        };
        let pixels = self.generate_pixels();
        let (pixels, width, height) = self.shaper.shape(pixels, self.width, self.height)?;
        let stats = self.stats.clone();
        let frame = Frame::new(pixels, width, height, self.frame_count)
            .with_release(move || {
                stats.frames_released.fetch_add(1, Ordering::SeqCst);
            });
        Ok((spectrum, frame))
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
            log::info!("SyntheticPlatform: released {}", self.device.id);
        }
        Ok(())
    }
}
